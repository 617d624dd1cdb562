//! Expression parsing using Pratt parsing.

use std::rc::Rc;

use crate::ast::*;
use crate::error::ParserError;
use crate::lexer::TokenKind;
use crate::span::Span;

use super::core::{ParseResult, Parser};
use super::precedence::{get_precedence, Precedence};

impl Parser {
    pub(crate) fn expression(&mut self) -> ParseResult<Expr> {
        self.parse_precedence(Precedence::Or)
    }

    pub(crate) fn parse_precedence(&mut self, min_precedence: Precedence) -> ParseResult<Expr> {
        let mut left = self.parse_prefix()?;

        while !self.is_at_end() {
            let precedence = get_precedence(&self.peek().kind);
            if precedence == Precedence::None || precedence < min_precedence {
                break;
            }

            left = self.parse_infix(left, precedence)?;
        }

        Ok(left)
    }

    fn parse_prefix(&mut self) -> ParseResult<Expr> {
        if self.is_at_end() {
            return Err(ParserError::unexpected_eof(self.current_span()));
        }
        let token = self.advance();
        let start_span = token.span;

        match &token.kind {
            TokenKind::IntLiteral(n) => {
                let value = i32::try_from(*n).map_err(|_| {
                    ParserError::general(format!("integer literal {} out of range", n), start_span)
                })?;
                Ok(literal(Literal::Int32(value), start_span))
            }
            TokenKind::Int64Literal(n) => Ok(literal(Literal::Int64(*n), start_span)),
            TokenKind::ByteLiteral(n) => Ok(literal(Literal::Byte(*n), start_span)),
            TokenKind::FloatLiteral(n) => Ok(literal(Literal::Float64(*n), start_span)),
            TokenKind::Float32Literal(n) => Ok(literal(Literal::Float32(*n), start_span)),
            TokenKind::CharLiteral(c) => Ok(literal(Literal::Char(*c), start_span)),
            TokenKind::StringLiteral(s) => Ok(literal(Literal::String(s.clone()), start_span)),
            TokenKind::BoolLiteral(b) => Ok(literal(Literal::Bool(*b), start_span)),

            TokenKind::Identifier(name) => {
                Ok(Expr::new(ExprKind::Variable(name.clone()), start_span))
            }

            TokenKind::LeftParen => self.parse_paren(start_span),
            TokenKind::LeftBracket => self.parse_list(start_span),
            TokenKind::LeftBrace => self.parse_block_expr(start_span),

            TokenKind::Minus => {
                if let Some(folded) = self.fold_negative_literal(start_span)? {
                    return Ok(folded);
                }
                self.parse_unary(UnaryOp::Negate, start_span)
            }
            TokenKind::Bang => self.parse_unary(UnaryOp::Not, start_span),
            TokenKind::Tilde => self.parse_unary(UnaryOp::BitNot, start_span),

            TokenKind::Pipe => self.parse_lambda(start_span),
            TokenKind::Or => self.finish_lambda(Vec::new(), start_span),
            TokenKind::Fn => self.parse_anonymous_function(start_span),

            TokenKind::If => self.parse_if(start_span),

            _ => Err(ParserError::unexpected_token(
                "expression",
                format!("{}", token.kind),
                start_span,
            )),
        }
    }

    fn parse_infix(&mut self, left: Expr, precedence: Precedence) -> ParseResult<Expr> {
        let token = self.advance();

        let operator = match token.kind {
            TokenKind::LeftParen => return self.finish_call(left),
            TokenKind::LeftBracket => {
                let index = self.expression()?;
                self.expect(&TokenKind::RightBracket)?;
                let span = left.span.merge(&self.previous_span());
                return Ok(Expr::new(
                    ExprKind::Index {
                        object: Box::new(left),
                        index: Box::new(index),
                    },
                    span,
                ));
            }
            TokenKind::Dot => return self.finish_tuple_field(left),

            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Subtract,
            TokenKind::Star => BinaryOp::Multiply,
            TokenKind::Slash => BinaryOp::Divide,
            TokenKind::Percent => BinaryOp::Modulo,
            TokenKind::StarStar => BinaryOp::Power,
            TokenKind::EqualEqual => BinaryOp::Equal,
            TokenKind::BangEqual => BinaryOp::NotEqual,
            TokenKind::Less => BinaryOp::Less,
            TokenKind::LessEqual => BinaryOp::LessEqual,
            TokenKind::Greater => BinaryOp::Greater,
            TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
            TokenKind::Amp => BinaryOp::BitAnd,
            TokenKind::Pipe => BinaryOp::BitOr,
            TokenKind::Caret => BinaryOp::BitXor,
            TokenKind::LessLess => BinaryOp::ShiftLeft,
            TokenKind::GreaterGreater => BinaryOp::ShiftRight,
            TokenKind::And => BinaryOp::And,
            TokenKind::Or => BinaryOp::Or,
            _ => {
                return Err(ParserError::unexpected_token(
                    "operator",
                    format!("{}", token.kind),
                    token.span,
                ))
            }
        };

        // `**` is right-associative, everything else binds left
        let right = if operator == BinaryOp::Power {
            self.parse_precedence(precedence)?
        } else {
            self.parse_precedence(precedence.next())?
        };
        let span = left.span.merge(&right.span);

        Ok(Expr::new(
            ExprKind::Binary {
                left: Box::new(left),
                operator,
                right: Box::new(right),
            },
            span,
        ))
    }

    fn parse_unary(&mut self, operator: UnaryOp, start_span: Span) -> ParseResult<Expr> {
        let operand = self.parse_precedence(Precedence::Unary)?;
        let span = start_span.merge(&operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                operator,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    /// `-` directly followed by an integer literal becomes a negative literal,
    /// so that `-2147483648` is representable.
    fn fold_negative_literal(&mut self, start_span: Span) -> ParseResult<Option<Expr>> {
        let lit = match self.peek().kind {
            TokenKind::IntLiteral(n) => {
                let value = i32::try_from(-n).map_err(|_| {
                    ParserError::general(format!("integer literal -{} out of range", n), start_span)
                })?;
                Literal::Int32(value)
            }
            TokenKind::Int64Literal(n) => Literal::Int64(n.wrapping_neg()),
            _ => return Ok(None),
        };
        self.advance();
        let span = start_span.merge(&self.previous_span());
        Ok(Some(literal(lit, span)))
    }

    fn finish_call(&mut self, callee: Expr) -> ParseResult<Expr> {
        let arguments = self.parse_expression_list(&TokenKind::RightParen)?;
        let span = callee.span.merge(&self.previous_span());

        Ok(Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                arguments,
            },
            span,
        ))
    }

    fn finish_tuple_field(&mut self, object: Expr) -> ParseResult<Expr> {
        let token = self.advance();
        let TokenKind::IntLiteral(index) = token.kind else {
            return Err(ParserError::unexpected_token(
                "tuple field index",
                format!("{}", token.kind),
                token.span,
            ));
        };
        let span = object.span.merge(&token.span);
        Ok(Expr::new(
            ExprKind::TupleField {
                object: Box::new(object),
                index: index as usize,
            },
            span,
        ))
    }

    /// Comma-separated expressions up to and including `end`.
    fn parse_expression_list(&mut self, end: &TokenKind) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();

        if !self.check(end) {
            loop {
                items.push(self.expression()?);
                if !self.match_token(&TokenKind::Comma) || self.check(end) {
                    break;
                }
            }
        }
        self.expect(end)?;

        Ok(items)
    }

    /// `( e )`, `()` or a tuple `(a, b)`.
    fn parse_paren(&mut self, start_span: Span) -> ParseResult<Expr> {
        if self.match_token(&TokenKind::RightParen) {
            let span = start_span.merge(&self.previous_span());
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), span));
        }

        let first = self.expression()?;
        if self.match_token(&TokenKind::RightParen) {
            let span = start_span.merge(&self.previous_span());
            return Ok(Expr::new(ExprKind::Grouping(Box::new(first)), span));
        }

        self.expect(&TokenKind::Comma)?;
        let mut items = vec![first];
        if !self.check(&TokenKind::RightParen) {
            items.extend(self.parse_expression_list(&TokenKind::RightParen)?);
        } else {
            self.advance();
        }
        let span = start_span.merge(&self.previous_span());
        Ok(Expr::new(ExprKind::Tuple(items), span))
    }

    fn parse_list(&mut self, start_span: Span) -> ParseResult<Expr> {
        let items = self.parse_expression_list(&TokenKind::RightBracket)?;
        let span = start_span.merge(&self.previous_span());
        Ok(Expr::new(ExprKind::List(items), span))
    }

    fn parse_block_expr(&mut self, start_span: Span) -> ParseResult<Expr> {
        let block = self.finish_block()?;
        let span = start_span.merge(&self.previous_span());
        Ok(Expr::new(ExprKind::Block(block), span))
    }

    /// Parse the rest of a block after its opening brace.
    pub(crate) fn finish_block(&mut self) -> ParseResult<Block> {
        let (statements, value) = self.statement_sequence(&TokenKind::RightBrace)?;
        self.expect(&TokenKind::RightBrace)?;
        Ok(Block {
            statements,
            value: value.map(Box::new),
        })
    }

    pub(crate) fn block_expression(&mut self) -> ParseResult<Expr> {
        let start_span = self.expect(&TokenKind::LeftBrace)?.span;
        self.parse_block_expr(start_span)
    }

    fn parse_if(&mut self, start_span: Span) -> ParseResult<Expr> {
        let condition = self.expression()?;
        let then_branch = self.block_expression()?;

        let else_branch = if self.match_token(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                let else_start = self.advance().span;
                Some(Box::new(self.parse_if(else_start)?))
            } else {
                Some(Box::new(self.block_expression()?))
            }
        } else {
            None
        };

        let span = start_span.merge(&self.previous_span());
        Ok(Expr::new(
            ExprKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch,
            },
            span,
        ))
    }

    fn parse_lambda(&mut self, start_span: Span) -> ParseResult<Expr> {
        let params = self.parse_params(&TokenKind::Pipe)?;
        self.finish_lambda(params, start_span)
    }

    fn parse_anonymous_function(&mut self, start_span: Span) -> ParseResult<Expr> {
        self.expect(&TokenKind::LeftParen)?;
        let params = self.parse_params(&TokenKind::RightParen)?;
        self.finish_lambda(params, start_span)
    }

    fn finish_lambda(&mut self, params: Vec<Parameter>, start_span: Span) -> ParseResult<Expr> {
        let return_type = if self.match_token(&TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = self.expression()?;
        let span = start_span.merge(&body.span);

        let decl = FunctionDecl {
            name: String::new(),
            params,
            return_type,
            body,
            span,
        };
        Ok(Expr::new(ExprKind::Lambda(Rc::new(decl)), span))
    }

    /// Parameters up to and including `end`: `a, b: Int32`.
    pub(crate) fn parse_params(&mut self, end: &TokenKind) -> ParseResult<Vec<Parameter>> {
        let mut params = Vec::new();

        if !self.check(end) {
            loop {
                let param_start = self.current_span();
                let name = self.expect_identifier()?;

                let type_annotation = if self.match_token(&TokenKind::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };

                params.push(Parameter {
                    name,
                    type_annotation,
                    span: param_start.merge(&self.previous_span()),
                });

                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(end)?;

        Ok(params)
    }
}

fn literal(lit: Literal, span: Span) -> Expr {
    Expr::new(ExprKind::Literal(lit), span)
}
