//! Type annotation parsing.

use crate::ast::*;
use crate::error::ParserError;
use crate::lexer::TokenKind;

use super::core::{ParseResult, Parser};

impl Parser {
    /// Parse a type: `Name`, `[T]`, `(A, B)` or `fn(A, B) -> R`.
    pub(crate) fn parse_type(&mut self) -> ParseResult<TypeAnnotation> {
        let start_span = self.current_span();

        if self.match_token(&TokenKind::LeftBracket) {
            let elem = self.parse_type()?;
            self.expect(&TokenKind::RightBracket)?;
            let span = start_span.merge(&self.previous_span());
            return Ok(TypeAnnotation::new(TypeKind::List(Box::new(elem)), span));
        }

        if self.match_token(&TokenKind::LeftParen) {
            let mut items = self.parse_type_list(&TokenKind::RightParen)?;
            let span = start_span.merge(&self.previous_span());
            if items.len() == 1 {
                if let Some(only) = items.pop() {
                    return Ok(only);
                }
            }
            return Ok(TypeAnnotation::new(TypeKind::Tuple(items), span));
        }

        if self.match_token(&TokenKind::Fn) {
            self.expect(&TokenKind::LeftParen)?;
            let params = self.parse_type_list(&TokenKind::RightParen)?;
            self.expect(&TokenKind::Arrow)?;
            let return_type = self.parse_type()?;
            let span = start_span.merge(&self.previous_span());
            return Ok(TypeAnnotation::new(
                TypeKind::Function {
                    params,
                    return_type: Box::new(return_type),
                },
                span,
            ));
        }

        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(TypeAnnotation::new(TypeKind::Named(name), start_span))
            }
            _ => Err(ParserError::unexpected_token(
                "type",
                format!("{}", self.peek().kind),
                start_span,
            )),
        }
    }

    fn parse_type_list(&mut self, end: &TokenKind) -> ParseResult<Vec<TypeAnnotation>> {
        let mut items = Vec::new();
        if !self.check(end) {
            loop {
                items.push(self.parse_type()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(end)?;
        Ok(items)
    }
}
