//! Parser: recursive descent over guard tokens.
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary := literal | path | "(" expr ")"
//! ```

use serde_json::Value;

use super::lexer::{Lexer, Token, TokenKind};
use crate::ports::GuardError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `root.path.to.value`
    Path { root: String, path: String },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn parse(input: &str) -> Result<Expr, GuardError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        parser.expect(TokenKind::Eof)?;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, GuardError> {
        let mut left = self.parse_and()?;
        while self.eat(TokenKind::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, GuardError> {
        let mut left = self.parse_unary()?;
        while self.eat(TokenKind::And) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, GuardError> {
        if self.eat(TokenKind::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, GuardError> {
        let left = self.parse_primary()?;
        let op = match self.current().kind {
            TokenKind::Eq => CompareOp::Eq,
            TokenKind::Ne => CompareOp::Ne,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Le => CompareOp::Le,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Ge => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, GuardError> {
        let token = self.current().clone();
        let expr = match token.kind {
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::Null => Expr::Literal(Value::Null),
            TokenKind::Str => Expr::Literal(Value::String(token.text)),
            TokenKind::Number => Expr::Literal(parse_number(&token)?),
            TokenKind::Path => {
                let (root, path) = token.text.split_once('.').unwrap_or((token.text.as_str(), ""));
                if !matches!(root, "job" | "step" | "params") {
                    return Err(GuardError::UnknownRoot(root.to_string()));
                }
                Expr::Path {
                    root: root.to_string(),
                    path: path.to_string(),
                }
            }
            TokenKind::OpenParen => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(TokenKind::CloseParen)?;
                return Ok(inner);
            }
            other => {
                return Err(GuardError::Syntax {
                    col: token.col,
                    message: format!("expected a value, found {other}"),
                });
            }
        };
        self.pos += 1;
        Ok(expr)
    }

    fn current(&self) -> &Token {
        // tokenize() always ends with Eof and the parser never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.current().kind == kind {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), GuardError> {
        let token = self.current();
        if token.kind == kind {
            self.pos += 1;
            Ok(())
        } else {
            Err(GuardError::Syntax {
                col: token.col,
                message: format!("expected {kind}, found {}", token.kind),
            })
        }
    }
}

fn parse_number(token: &Token) -> Result<Value, GuardError> {
    let invalid = || GuardError::Syntax {
        col: token.col,
        message: format!("invalid number '{}'", token.text),
    };
    if let Ok(n) = token.text.parse::<i64>() {
        return Ok(Value::from(n));
    }
    let f = token.text.parse::<f64>().map_err(|_| invalid())?;
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(root: &str, path: &str) -> Box<Expr> {
        Box::new(Expr::Path {
            root: root.into(),
            path: path.into(),
        })
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = Parser::parse("params.a || params.b && !params.c").unwrap();
        assert_eq!(
            expr,
            Expr::Or(
                path("params", "a"),
                Box::new(Expr::And(path("params", "b"), Box::new(Expr::Not(path("params", "c")))))
            )
        );
    }

    #[test]
    fn comparison_with_literal() {
        let expr = Parser::parse("(job.params.replicas > 2.5)").unwrap();
        assert_eq!(
            expr,
            Expr::Compare(CompareOp::Gt, path("job", "params.replicas"), Box::new(Expr::Literal(json!(2.5))))
        );
    }

    #[test]
    fn errors_point_at_the_token() {
        assert!(matches!(
            Parser::parse("params.a &&"),
            Err(GuardError::Syntax { col: 12, .. })
        ));
        assert!(matches!(
            Parser::parse("(params.a"),
            Err(GuardError::Syntax { col: 10, .. })
        ));
        assert_eq!(
            Parser::parse("env.HOME == 'x'"),
            Err(GuardError::UnknownRoot("env".into()))
        );
    }
}
