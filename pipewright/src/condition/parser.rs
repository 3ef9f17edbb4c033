//! Tokenizer and recursive-descent parser for condition expressions.

use super::{CompareOp, Condition, StatusCheck};
use crate::errors::ConditionError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Ident(String),
    Str(String),
}

impl Token {
    fn text(&self) -> String {
        match self {
            Self::LParen => "(".into(),
            Self::RParen => ")".into(),
            Self::Not => "!".into(),
            Self::And => "&&".into(),
            Self::Or => "||".into(),
            Self::Eq => "==".into(),
            Self::Ne => "!=".into(),
            Self::Ident(s) => s.clone(),
            Self::Str(s) => format!("'{s}'"),
        }
    }
}

fn tokenize(expr: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let bytes = expr.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                tokens.push((Token::LParen, start));
                i += 1;
            }
            b')' => {
                tokens.push((Token::RParen, start));
                i += 1;
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((Token::Ne, start));
                i += 2;
            }
            b'!' => {
                tokens.push((Token::Not, start));
                i += 1;
            }
            b'=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((Token::Eq, start));
                i += 2;
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push((Token::And, start));
                i += 2;
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push((Token::Or, start));
                i += 2;
            }
            b'\'' | b'"' => {
                let quote = c;
                let body_start = i + 1;
                let Some(len) = bytes[body_start..].iter().position(|&b| b == quote) else {
                    return Err(ConditionError::UnterminatedString {
                        expr: expr.to_string(),
                    });
                };
                tokens.push((Token::Str(expr[body_start..body_start + len].to_string()), start));
                i = body_start + len + 1;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
                {
                    i += 1;
                }
                tokens.push((Token::Ident(expr[start..i].to_string()), start));
            }
            _ => {
                let ch = expr[start..].chars().next().unwrap_or('?');
                return Err(ConditionError::UnexpectedToken {
                    expr: expr.to_string(),
                    token: ch.to_string(),
                    offset: start,
                });
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    expr: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Token, usize), ConditionError> {
        let item = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ConditionError::UnexpectedEnd {
                expr: self.expr.to_string(),
            })?;
        self.pos += 1;
        Ok(item)
    }

    fn unexpected(&self, token: &Token, offset: usize) -> ConditionError {
        ConditionError::UnexpectedToken {
            expr: self.expr.to_string(),
            token: token.text(),
            offset,
        }
    }

    fn expect(&mut self, wanted: &Token) -> Result<(), ConditionError> {
        let (token, offset) = self.next()?;
        if &token == wanted {
            Ok(())
        } else {
            Err(self.unexpected(&token, offset))
        }
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Condition::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Condition::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Condition, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, ConditionError> {
        let (token, offset) = self.next()?;
        match token {
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) if name == "true" => Ok(Condition::Literal(true)),
            Token::Ident(name) if name == "false" => Ok(Condition::Literal(false)),
            Token::Ident(name) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                self.expect(&Token::RParen)?;
                let check = match name.as_str() {
                    "success" => StatusCheck::Success,
                    "failure" => StatusCheck::Failure,
                    "always" => StatusCheck::Always,
                    "cancelled" => StatusCheck::Cancelled,
                    _ => {
                        return Err(ConditionError::UnknownFunction {
                            expr: self.expr.to_string(),
                            name,
                        })
                    }
                };
                Ok(Condition::Status(check))
            }
            Token::Ident(name) => {
                let var = match name.strip_prefix("env.") {
                    Some(var) if !var.is_empty() && !var.contains('.') => var.to_string(),
                    _ => return Err(self.unexpected(&Token::Ident(name.clone()), offset)),
                };
                let op = match self.peek() {
                    Some(Token::Eq) => CompareOp::Eq,
                    Some(Token::Ne) => CompareOp::Ne,
                    _ => return Ok(Condition::Env(var)),
                };
                self.pos += 1;
                match self.next()? {
                    (Token::Str(value), _) => Ok(Condition::Compare { var, op, value }),
                    (other, offset) => Err(self.unexpected(&other, offset)),
                }
            }
            other => Err(self.unexpected(&other, offset)),
        }
    }
}

/// Parses a condition expression. Blank input means `success()`.
pub(super) fn parse(expr: &str) -> Result<Condition, ConditionError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Ok(Condition::Status(StatusCheck::Success));
    }

    let mut parser = Parser {
        expr,
        tokens,
        pos: 0,
    };
    let condition = parser.parse_or()?;
    if let Some((token, offset)) = parser.tokens.get(parser.pos) {
        return Err(parser.unexpected(token, *offset));
    }
    Ok(condition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_and_binds_tighter() {
        let parsed = parse("failure() || success() && cancelled()").unwrap();
        assert_eq!(
            parsed,
            Condition::Or(
                Box::new(Condition::Status(StatusCheck::Failure)),
                Box::new(Condition::And(
                    Box::new(Condition::Status(StatusCheck::Success)),
                    Box::new(Condition::Status(StatusCheck::Cancelled)),
                )),
            )
        );
    }

    #[test]
    fn test_env_comparison() {
        let parsed = parse("env.BRANCH == \"main\"").unwrap();
        assert_eq!(
            parsed,
            Condition::Compare {
                var: "BRANCH".into(),
                op: CompareOp::Eq,
                value: "main".into(),
            }
        );
    }

    #[test]
    fn test_unknown_function() {
        let err = parse("sometimes()").unwrap_err();
        assert!(matches!(err, ConditionError::UnknownFunction { name, .. } if name == "sometimes"));
    }

    #[test]
    fn test_shell_text_is_rejected() {
        let err = parse("test -f out/app").unwrap_err();
        assert!(matches!(err, ConditionError::UnexpectedToken { offset: 0, .. }));

        assert!(parse("rm -rf /").is_err());
        assert!(parse("success() ;").is_err());
    }

    #[test]
    fn test_trailing_and_missing_tokens() {
        assert!(matches!(
            parse("success() &&").unwrap_err(),
            ConditionError::UnexpectedEnd { .. }
        ));
        assert!(matches!(
            parse("(always()").unwrap_err(),
            ConditionError::UnexpectedEnd { .. }
        ));
        assert!(matches!(
            parse("success() always()").unwrap_err(),
            ConditionError::UnexpectedToken { .. }
        ));
        assert!(matches!(
            parse("env.X == 'main").unwrap_err(),
            ConditionError::UnterminatedString { .. }
        ));
    }
}
