//! Lexer: tokenizes a guard expression.

use crate::ports::GuardError;

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Column number (1-based)
    pub col: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, col: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            col,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // Literals and paths
    Path,
    Str,
    Number,
    True,
    False,
    Null,

    // Operators
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    OpenParen,
    CloseParen,

    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Path => "path",
            Self::Str => "string literal",
            Self::Number => "number",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Not => "!",
            Self::OpenParen => "(",
            Self::CloseParen => ")",
            Self::Eof => "end of input",
        };
        f.write_str(s)
    }
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, GuardError> {
        let mut tokens = Vec::new();
        loop {
            while self.peek_at(0).is_some_and(char::is_whitespace) {
                self.pos += 1;
            }
            if self.pos >= self.input.len() {
                tokens.push(Token::new(TokenKind::Eof, "", self.pos + 1));
                return Ok(tokens);
            }
            tokens.push(self.next_token()?);
        }
    }

    fn next_token(&mut self) -> Result<Token, GuardError> {
        let col = self.pos + 1;
        let ch = self.input[self.pos];
        let pair = |kind: TokenKind, text: &str| -> Result<Token, GuardError> {
            Ok(Token::new(kind, text, col))
        };

        match (ch, self.peek_at(1)) {
            ('=', Some('=')) => self.take(2, pair(TokenKind::Eq, "==")),
            ('!', Some('=')) => self.take(2, pair(TokenKind::Ne, "!=")),
            ('<', Some('=')) => self.take(2, pair(TokenKind::Le, "<=")),
            ('>', Some('=')) => self.take(2, pair(TokenKind::Ge, ">=")),
            ('&', Some('&')) => self.take(2, pair(TokenKind::And, "&&")),
            ('|', Some('|')) => self.take(2, pair(TokenKind::Or, "||")),
            ('<', _) => self.take(1, pair(TokenKind::Lt, "<")),
            ('>', _) => self.take(1, pair(TokenKind::Gt, ">")),
            ('!', _) => self.take(1, pair(TokenKind::Not, "!")),
            ('(', _) => self.take(1, pair(TokenKind::OpenParen, "(")),
            (')', _) => self.take(1, pair(TokenKind::CloseParen, ")")),
            ('"' | '\'', _) => self.read_string(ch),
            (c, _) if c.is_ascii_digit() => self.read_number(),
            ('-', Some(c)) if c.is_ascii_digit() => self.read_number(),
            (c, _) if c.is_alphabetic() || c == '_' || c == '$' => self.read_word(),
            _ => Err(GuardError::Syntax {
                col,
                message: format!("unexpected character '{ch}'"),
            }),
        }
    }

    fn take(&mut self, n: usize, token: Result<Token, GuardError>) -> Result<Token, GuardError> {
        self.pos += n;
        token
    }

    fn read_string(&mut self, quote: char) -> Result<Token, GuardError> {
        let col = self.pos + 1;
        self.pos += 1; // opening quote

        let mut text = String::new();
        loop {
            match self.peek_at(0) {
                None => {
                    return Err(GuardError::Syntax {
                        col,
                        message: "unterminated string literal".into(),
                    });
                }
                Some('\\') if self.peek_at(1).is_some() => {
                    if let Some(escaped) = self.peek_at(1) {
                        text.push(escaped);
                    }
                    self.pos += 2;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(Token::new(TokenKind::Str, text, col));
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, GuardError> {
        let col = self.pos + 1;
        let start = self.pos;
        self.pos += 1;
        while self
            .peek_at(0)
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        let text: String = self.input[start..self.pos].iter().collect();
        Ok(Token::new(TokenKind::Number, text, col))
    }

    fn read_word(&mut self) -> Result<Token, GuardError> {
        let col = self.pos + 1;
        let start = self.pos;
        while self
            .peek_at(0)
            .is_some_and(|c| c.is_alphanumeric() || matches!(c, '_' | '$' | '.' | '-'))
        {
            self.pos += 1;
        }
        let text: String = self.input[start..self.pos].iter().collect();
        let kind = match text.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Path,
        };
        Ok(Token::new(kind, text, col))
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }
}
