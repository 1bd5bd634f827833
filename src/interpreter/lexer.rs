use std::rc::Rc;

use super::value::parse_number;
use super::{Result, ScriptError};

/// Lexical tokens.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifier.
    Name(Rc<str>),
    /// Numeric literal.
    Number(f64),
    /// String literal, escapes already resolved.
    Str(Rc<str>),
    /// Reserved word.
    Keyword(Keyword),
    /// Punctuation or operator.
    Symbol(&'static str),
    /// End of input.
    Eof,
}

/// Reserved words.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,
}

impl Keyword {
    fn from_word(word: &str) -> Option<Keyword> {
        Some(match word {
            "and" => Keyword::And,
            "break" => Keyword::Break,
            "do" => Keyword::Do,
            "else" => Keyword::Else,
            "elseif" => Keyword::Elseif,
            "end" => Keyword::End,
            "false" => Keyword::False,
            "for" => Keyword::For,
            "function" => Keyword::Function,
            "if" => Keyword::If,
            "in" => Keyword::In,
            "local" => Keyword::Local,
            "nil" => Keyword::Nil,
            "not" => Keyword::Not,
            "or" => Keyword::Or,
            "repeat" => Keyword::Repeat,
            "return" => Keyword::Return,
            "then" => Keyword::Then,
            "true" => Keyword::True,
            "until" => Keyword::Until,
            "while" => Keyword::While,
            _ => return None,
        })
    }
}

// Longest spellings first so `..` wins over `.` and `==` over `=`.
const SYMBOLS: &[&str] = &[
    "...", "..", "==", "~=", "<=", ">=", "+", "-", "*", "/", "%", "^", "#", "<", ">", "=", "(",
    ")", "{", "}", "[", "]", ";", ":", ",", ".",
];

/// Token paired with the line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    /// The token.
    pub token: Token,
    /// 1-based line number.
    pub line: u32,
}

/// Split source text into tokens, ending with [`Token::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Spanned>> {
    let mut lexer = Lexer {
        src: source,
        bytes: source.as_bytes(),
        index: 0,
        line: 1,
    };
    let mut tokens = Vec::new();
    loop {
        lexer.skip_trivia()?;
        let line = lexer.line;
        let token = lexer.next_token()?;
        let done = token == Token::Eof;
        tokens.push(Spanned { token, line });
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current() {
            if ch == b'\n' {
                self.line += 1;
            }
            self.index += 1;
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            message: message.into(),
            line: self.line,
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.current() {
                Some(ch) if ch.is_ascii_whitespace() => self.advance(),
                Some(b'-') if self.peek(1) == Some(b'-') => {
                    self.index += 2;
                    if let Some(level) = self.long_bracket_level() {
                        self.read_long_bracket(level)?;
                    } else {
                        while let Some(ch) = self.current() {
                            if ch == b'\n' {
                                break;
                            }
                            self.advance();
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        let Some(ch) = self.current() else {
            return Ok(Token::Eof);
        };
        if let Some(level) = self.long_bracket_level() {
            let text = self.read_long_bracket(level)?;
            return Ok(Token::Str(Rc::from(text)));
        }
        match ch {
            b'"' | b'\'' => self.read_string(ch),
            b'0'..=b'9' => self.read_number(),
            b'.' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => self.read_number(),
            c if c == b'_' || c.is_ascii_alphabetic() => Ok(self.read_word()),
            _ => {
                let rest = &self.src[self.index..];
                for symbol in SYMBOLS {
                    if rest.starts_with(symbol) {
                        self.index += symbol.len();
                        return Ok(Token::Symbol(symbol));
                    }
                }
                let unexpected = rest.chars().next().unwrap_or('?');
                Err(self.error(format!("unexpected character '{unexpected}'")))
            }
        }
    }

    fn read_word(&mut self) -> Token {
        let start = self.index;
        while let Some(ch) = self.current() {
            if ch == b'_' || ch.is_ascii_alphanumeric() {
                self.index += 1;
            } else {
                break;
            }
        }
        let word = &self.src[start..self.index];
        match Keyword::from_word(word) {
            Some(keyword) => Token::Keyword(keyword),
            None => Token::Name(Rc::from(word)),
        }
    }

    fn read_number(&mut self) -> Result<Token> {
        let start = self.index;
        if self.current() == Some(b'0') && matches!(self.peek(1), Some(b'x' | b'X')) {
            self.index += 2;
            while self.current().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.index += 1;
            }
        } else {
            while let Some(ch) = self.current() {
                let exponent_sign = matches!(ch, b'+' | b'-')
                    && matches!(self.bytes.get(self.index - 1), Some(b'e' | b'E'));
                if ch.is_ascii_alphanumeric() || ch == b'.' || exponent_sign {
                    self.index += 1;
                } else {
                    break;
                }
            }
        }
        let text = &self.src[start..self.index];
        parse_number(text)
            .map(Token::Number)
            .ok_or_else(|| self.error(format!("malformed number '{text}'")))
    }

    fn read_string(&mut self, quote: u8) -> Result<Token> {
        self.advance();
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let Some(ch) = self.current() else {
                return Err(self.error("unfinished string"));
            };
            match ch {
                b'\n' => return Err(self.error("unfinished string")),
                c if c == quote => {
                    self.advance();
                    break;
                }
                b'\\' => {
                    self.advance();
                    let escaped = self
                        .current()
                        .ok_or_else(|| self.error("unfinished string"))?;
                    self.advance();
                    match escaped {
                        b'n' => buf.push(b'\n'),
                        b't' => buf.push(b'\t'),
                        b'r' => buf.push(b'\r'),
                        b'0' => buf.push(0),
                        b'\\' => buf.push(b'\\'),
                        b'"' => buf.push(b'"'),
                        b'\'' => buf.push(b'\''),
                        b'\n' => buf.push(b'\n'),
                        other => {
                            return Err(self.error(format!(
                                "invalid escape sequence '\\{}'",
                                other as char
                            )));
                        }
                    }
                }
                _ => {
                    buf.push(ch);
                    self.advance();
                }
            }
        }
        let text = String::from_utf8(buf).map_err(|_| self.error("string is not valid UTF-8"))?;
        Ok(Token::Str(Rc::from(text)))
    }

    /// Level of a long bracket (`[[`, `[=[`, ...) starting at the cursor.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.current() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek(1 + level) == Some(b'=') {
            level += 1;
        }
        (self.peek(1 + level) == Some(b'[')).then_some(level)
    }

    fn read_long_bracket(&mut self, level: usize) -> Result<String> {
        self.index += level + 2;
        if self.current() == Some(b'\n') {
            self.advance();
        }
        let close = format!("]{}]", "=".repeat(level));
        let start = self.index;
        while self.index < self.bytes.len() {
            if self.bytes[self.index..].starts_with(close.as_bytes()) {
                let text = self.src[start..self.index].to_string();
                self.index += close.len();
                return Ok(text);
            }
            self.advance();
        }
        Err(self.error("unfinished long string or comment"))
    }
}
