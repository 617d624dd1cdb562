//! Statement parsing: let bindings, function declarations, statement sequences.

use std::rc::Rc;

use crate::ast::*;
use crate::error::ParserError;
use crate::lexer::TokenKind;

use super::core::{ParseResult, Parser};

impl Parser {
    /// Statements up to (not including) `end`. A final expression without a
    /// trailing `;` becomes the sequence's value.
    pub(crate) fn statement_sequence(
        &mut self,
        end: &TokenKind,
    ) -> ParseResult<(Vec<Stmt>, Option<Expr>)> {
        let mut statements = Vec::new();

        while !self.check(end) {
            if self.is_at_end() {
                return Err(ParserError::unexpected_eof(self.current_span()));
            }
            if self.match_token(&TokenKind::Semicolon) {
                continue;
            }

            if self.check(&TokenKind::Let) {
                statements.push(self.let_declaration()?);
                continue;
            }
            if self.check(&TokenKind::Fn)
                && matches!(self.peek_nth(1).kind, TokenKind::Identifier(_))
            {
                statements.push(self.function_declaration()?);
                continue;
            }

            let expr = self.expression()?;
            if self.match_token(&TokenKind::Semicolon) {
                let span = expr.span.merge(&self.previous_span());
                statements.push(Stmt::new(StmtKind::Expression(expr), span));
            } else if self.check(end) {
                return Ok((statements, Some(expr)));
            } else if matches!(expr.kind, ExprKind::Block(_) | ExprKind::If { .. }) {
                let span = expr.span;
                statements.push(Stmt::new(StmtKind::Expression(expr), span));
            } else {
                return Err(ParserError::unexpected_token(
                    "';'",
                    format!("{}", self.peek().kind),
                    self.current_span(),
                ));
            }
        }

        Ok((statements, None))
    }

    fn let_declaration(&mut self) -> ParseResult<Stmt> {
        let start_span = self.expect(&TokenKind::Let)?.span;
        let name = self.expect_identifier()?;

        let type_annotation = if self.match_token(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        self.expect(&TokenKind::Equal)?;
        let mut initializer = self.expression()?;
        self.expect(&TokenKind::Semicolon)?;

        // A bound lambda takes the binding's name
        if let ExprKind::Lambda(decl) = &mut initializer.kind {
            Rc::make_mut(decl).name = name.clone();
        }

        let span = start_span.merge(&self.previous_span());
        Ok(Stmt::new(
            StmtKind::Let {
                name,
                type_annotation,
                initializer,
            },
            span,
        ))
    }

    fn function_declaration(&mut self) -> ParseResult<Stmt> {
        let start_span = self.expect(&TokenKind::Fn)?.span;
        let name = self.expect_identifier()?;

        self.expect(&TokenKind::LeftParen)?;
        let params = self.parse_params(&TokenKind::RightParen)?;

        let return_type = if self.match_token(&TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = self.block_expression()?;
        let span = start_span.merge(&self.previous_span());

        let decl = FunctionDecl {
            name,
            params,
            return_type,
            body,
            span,
        };
        Ok(Stmt::new(StmtKind::Function(Rc::new(decl)), span))
    }
}
