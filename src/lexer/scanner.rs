//! Lexer/Scanner for Kindle source code.

use crate::error::LexerError;
use crate::lexer::token::{Token, TokenKind};
use crate::span::Span;

/// The lexer transforms source code into a stream of tokens.
pub struct Scanner<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    line: usize,
    column: usize,
    start_pos: usize,
    start_line: usize,
    start_column: usize,
    // `t.0.1` must scan as two field accesses, not as `t . 0.1`
    after_dot: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            line: 1,
            column: 1,
            start_pos: 0,
            start_line: 1,
            start_column: 1,
            after_dot: false,
        }
    }

    /// Scan all tokens from the source.
    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.scan_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            self.after_dot = token.kind == TokenKind::Dot;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        Ok(tokens)
    }

    /// Scan the next token.
    pub fn scan_token(&mut self) -> Result<Token, LexerError> {
        self.skip_whitespace_and_comments();
        self.mark_start();

        let Some((_, c)) = self.advance() else {
            return Ok(Token::eof(self.current_pos, self.line, self.column));
        };

        match c {
            // Single-character tokens
            '(' => Ok(self.make_token(TokenKind::LeftParen)),
            ')' => Ok(self.make_token(TokenKind::RightParen)),
            '{' => Ok(self.make_token(TokenKind::LeftBrace)),
            '}' => Ok(self.make_token(TokenKind::RightBrace)),
            '[' => Ok(self.make_token(TokenKind::LeftBracket)),
            ']' => Ok(self.make_token(TokenKind::RightBracket)),
            ',' => Ok(self.make_token(TokenKind::Comma)),
            '.' => Ok(self.make_token(TokenKind::Dot)),
            ':' => Ok(self.make_token(TokenKind::Colon)),
            ';' => Ok(self.make_token(TokenKind::Semicolon)),
            '+' => Ok(self.make_token(TokenKind::Plus)),
            '/' => Ok(self.make_token(TokenKind::Slash)),
            '%' => Ok(self.make_token(TokenKind::Percent)),
            '~' => Ok(self.make_token(TokenKind::Tilde)),
            '^' => Ok(self.make_token(TokenKind::Caret)),

            // One or two character tokens
            '*' => {
                if self.match_char('*') {
                    Ok(self.make_token(TokenKind::StarStar))
                } else {
                    Ok(self.make_token(TokenKind::Star))
                }
            }
            '-' => {
                if self.match_char('>') {
                    Ok(self.make_token(TokenKind::Arrow))
                } else {
                    Ok(self.make_token(TokenKind::Minus))
                }
            }
            '=' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::EqualEqual))
                } else {
                    Ok(self.make_token(TokenKind::Equal))
                }
            }
            '!' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::BangEqual))
                } else {
                    Ok(self.make_token(TokenKind::Bang))
                }
            }
            '<' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::LessEqual))
                } else if self.match_char('<') {
                    Ok(self.make_token(TokenKind::LessLess))
                } else {
                    Ok(self.make_token(TokenKind::Less))
                }
            }
            '>' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::GreaterEqual))
                } else if self.match_char('>') {
                    Ok(self.make_token(TokenKind::GreaterGreater))
                } else {
                    Ok(self.make_token(TokenKind::Greater))
                }
            }
            '&' => {
                if self.match_char('&') {
                    Ok(self.make_token(TokenKind::And))
                } else {
                    Ok(self.make_token(TokenKind::Amp))
                }
            }
            '|' => {
                if self.match_char('|') {
                    Ok(self.make_token(TokenKind::Or))
                } else {
                    Ok(self.make_token(TokenKind::Pipe))
                }
            }

            '"' => self.scan_string(),
            '\'' => self.scan_char(),

            c if c.is_ascii_digit() => self.scan_number(c),

            c if c.is_alphabetic() || c == '_' => self.scan_identifier(c),

            _ => Err(LexerError::unexpected_char(c, self.current_span())),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.advance();
                }
                Some('\n') => {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                Some('/') => {
                    if self.peek_next() == Some('/') {
                        while self.peek().is_some() && self.peek() != Some('\n') {
                            self.advance();
                        }
                    } else if self.peek_next() == Some('*') {
                        self.advance();
                        self.advance();
                        let mut depth = 1;
                        while depth > 0 {
                            match self.peek() {
                                None => break,
                                Some('*') if self.peek_next() == Some('/') => {
                                    self.advance();
                                    self.advance();
                                    depth -= 1;
                                }
                                Some('/') if self.peek_next() == Some('*') => {
                                    self.advance();
                                    self.advance();
                                    depth += 1;
                                }
                                Some('\n') => {
                                    self.advance();
                                    self.line += 1;
                                    self.column = 1;
                                }
                                _ => {
                                    self.advance();
                                }
                            }
                        }
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_string(&mut self) -> Result<Token, LexerError> {
        let mut value = String::new();

        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(LexerError::unterminated_string(self.current_span()));
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    value.push(self.scan_escape()?);
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
            }
        }

        Ok(self.make_token(TokenKind::StringLiteral(value)))
    }

    fn scan_char(&mut self) -> Result<Token, LexerError> {
        let c = match self.advance() {
            Some((_, '\\')) => self.scan_escape()?,
            Some((_, '\'')) | Some((_, '\n')) | None => {
                return Err(LexerError::invalid_char(self.current_span()));
            }
            Some((_, c)) => c,
        };
        if !self.match_char('\'') {
            return Err(LexerError::invalid_char(self.current_span()));
        }
        Ok(self.make_token(TokenKind::CharLiteral(c)))
    }

    /// Decode the character following a backslash.
    fn scan_escape(&mut self) -> Result<char, LexerError> {
        match self.advance() {
            Some((_, 'n')) => Ok('\n'),
            Some((_, 't')) => Ok('\t'),
            Some((_, 'r')) => Ok('\r'),
            Some((_, '0')) => Ok('\0'),
            Some((_, '\\')) => Ok('\\'),
            Some((_, '"')) => Ok('"'),
            Some((_, '\'')) => Ok('\''),
            Some((_, c)) => Err(LexerError::invalid_escape(c, self.current_span())),
            None => Err(LexerError::unterminated_string(self.current_span())),
        }
    }

    fn scan_number(&mut self, first: char) -> Result<Token, LexerError> {
        let mut value = String::from(first);
        let mut is_float = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                value.push(c);
                self.advance();
            } else if c == '.' && !is_float && !self.after_dot {
                match self.peek_next() {
                    Some(next) if next.is_ascii_digit() => {
                        is_float = true;
                        value.push(c);
                        self.advance();
                    }
                    _ => break,
                }
            } else if c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        // Type suffix, only when it is not the start of an identifier
        let suffix = match self.peek() {
            Some(s @ ('l' | 'L' | 'b' | 'f'))
                if !matches!(self.peek_next(), Some(n) if n.is_alphanumeric() || n == '_') =>
            {
                self.advance();
                Some(s)
            }
            _ => None,
        };

        let invalid = || LexerError::invalid_number(value.clone(), self.current_span());
        let kind = match (suffix, is_float) {
            (Some('f'), _) => TokenKind::Float32Literal(value.parse().map_err(|_| invalid())?),
            (None, true) => TokenKind::FloatLiteral(value.parse().map_err(|_| invalid())?),
            (Some(_), true) => return Err(invalid()),
            (Some('b'), false) => TokenKind::ByteLiteral(value.parse().map_err(|_| invalid())?),
            (Some(_), false) => TokenKind::Int64Literal(value.parse().map_err(|_| invalid())?),
            (None, false) => TokenKind::IntLiteral(value.parse().map_err(|_| invalid())?),
        };
        Ok(self.make_token(kind))
    }

    fn scan_identifier(&mut self, first: char) -> Result<Token, LexerError> {
        let mut value = String::from(first);

        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                value.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = TokenKind::keyword(&value).unwrap_or(TokenKind::Identifier(value));
        Ok(self.make_token(kind))
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        if let Some((pos, c)) = self.chars.next() {
            self.current_pos = pos + c.len_utf8();
            self.column += 1;
            Some((pos, c))
        } else {
            None
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_next(&self) -> Option<char> {
        let mut iter = self.source[self.current_pos..].chars();
        iter.next();
        iter.next()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn mark_start(&mut self) {
        self.start_pos = self.current_pos;
        self.start_line = self.line;
        self.start_column = self.column;
    }

    fn current_span(&self) -> Span {
        Span::new(
            self.start_pos,
            self.current_pos,
            self.start_line,
            self.start_column,
        )
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.current_span())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scan(source: &str) -> Vec<TokenKind> {
        Scanner::new(source)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            scan("(){}[]"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_and_suffixes() {
        assert_eq!(
            scan("42 3.25 7L 255b 1.5f 2f"),
            vec![
                TokenKind::IntLiteral(42),
                TokenKind::FloatLiteral(3.25),
                TokenKind::Int64Literal(7),
                TokenKind::ByteLiteral(255),
                TokenKind::Float32Literal(1.5),
                TokenKind::Float32Literal(2.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_suffix_letter_starting_identifier_is_not_a_suffix() {
        assert_eq!(
            scan("3bar"),
            vec![
                TokenKind::IntLiteral(3),
                TokenKind::Identifier("bar".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_byte_literal_out_of_range() {
        assert!(Scanner::new("256b").scan_tokens().is_err());
    }

    #[test]
    fn test_string_and_char() {
        assert_eq!(
            scan(r#""hi\n" 'a' '\''"#),
            vec![
                TokenKind::StringLiteral("hi\n".to_string()),
                TokenKind::CharLiteral('a'),
                TokenKind::CharLiteral('\''),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            Scanner::new("\"abc").scan_tokens(),
            Err(LexerError::UnterminatedString(_))
        ));
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            scan("let fn if else true"),
            vec![
                TokenKind::Let,
                TokenKind::Fn,
                TokenKind::If,
                TokenKind::Else,
                TokenKind::BoolLiteral(true),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            scan("+ - * ** == != << >> & && | || -> ~ ^"),
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::StarStar,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessLess,
                TokenKind::GreaterGreater,
                TokenKind::Amp,
                TokenKind::And,
                TokenKind::Pipe,
                TokenKind::Or,
                TokenKind::Arrow,
                TokenKind::Tilde,
                TokenKind::Caret,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_nested_tuple_field() {
        assert_eq!(
            scan("t.0.1"),
            vec![
                TokenKind::Identifier("t".to_string()),
                TokenKind::Dot,
                TokenKind::IntLiteral(0),
                TokenKind::Dot,
                TokenKind::IntLiteral(1),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            scan("1 // comment\n/* a /* nested */ b */ 2"),
            vec![
                TokenKind::IntLiteral(1),
                TokenKind::IntLiteral(2),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_token_lines() {
        let tokens = Scanner::new("a\n  b").scan_tokens().unwrap();
        assert_eq!(tokens[1].span.line, 2);
        assert_eq!(tokens[1].span.column, 3);
    }
}
