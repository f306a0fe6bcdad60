//! GDBMI テキストのパーサ
//!
//! 文法:
//! ```text
//! value  := c-string | tuple | list
//! tuple  := '{' [item (',' item)*] '}'
//! list   := '[' [item (',' item)*] ']'
//! item   := name '=' value | value
//! ```
//! トップレベルは値そのもの、またはカンマ区切りの `name=value` 列（無名タプルになる）。

use crate::value::{MiData, MiValue};
use thiserror::Error;

/// パースエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("GDBMI parse error at offset {position}: {reason}")]
pub struct MiParseError {
    /// エラー位置（バイトオフセット）
    pub position: usize,
    /// 理由
    pub reason: &'static str,
}

/// GDBMI テキストをパースする
pub fn parse(text: &str) -> Result<MiValue, MiParseError> {
    let mut parser = Parser { input: text, pos: 0 };
    parser.skip_spaces();
    let value = match parser.peek() {
        Some('{') | Some('[') | Some('"') => parser.parse_value(String::new())?,
        Some(_) => {
            // `name=value,name=value` を無名タプルとして扱う
            let mut children = vec![parser.parse_result()?];
            while parser.eat(',') {
                parser.skip_spaces();
                children.push(parser.parse_result()?);
            }
            MiValue::tuple("", children)
        }
        None => return Err(parser.error("empty input")),
    };
    parser.skip_spaces();
    if parser.peek().is_some() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn error(&self, reason: &'static str) -> MiParseError {
        MiParseError {
            position: self.pos,
            reason,
        }
    }

    /// `name=value`
    fn parse_result(&mut self) -> Result<MiValue, MiParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '=' || c == ',' || c == '}' || c == ']' || c == '{' || c == '[' || c == '"' {
                break;
            }
            self.bump();
        }
        let name = self.input[start..self.pos].trim().to_string();
        if name.is_empty() {
            return Err(self.error("expected name"));
        }
        if !self.eat('=') {
            return Err(self.error("expected '='"));
        }
        self.parse_value(name)
    }

    /// `name=value` または `value`
    fn parse_item(&mut self) -> Result<MiValue, MiParseError> {
        self.skip_spaces();
        match self.peek() {
            Some('{') | Some('[') | Some('"') => self.parse_value(String::new()),
            Some(_) => self.parse_result(),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_value(&mut self, name: String) -> Result<MiValue, MiParseError> {
        match self.peek() {
            Some('"') => {
                let s = self.parse_c_string()?;
                Ok(MiValue {
                    name,
                    data: MiData::Scalar(s),
                })
            }
            Some('{') => {
                self.bump();
                let children = self.parse_items('}')?;
                Ok(MiValue::tuple(name, children))
            }
            Some('[') => {
                self.bump();
                let children = self.parse_items(']')?;
                Ok(MiValue::list(name, children))
            }
            _ => Err(self.error("expected value")),
        }
    }

    fn parse_items(&mut self, close: char) -> Result<Vec<MiValue>, MiParseError> {
        let mut children = Vec::new();
        self.skip_spaces();
        if self.eat(close) {
            return Ok(children);
        }
        loop {
            children.push(self.parse_item()?);
            self.skip_spaces();
            if self.eat(',') {
                continue;
            }
            if self.eat(close) {
                return Ok(children);
            }
            return Err(self.error("expected ',' or closing bracket"));
        }
    }

    fn parse_c_string(&mut self) -> Result<String, MiParseError> {
        if !self.eat('"') {
            return Err(self.error("expected '\"'"));
        }
        let mut out = String::new();
        loop {
            let c = self.bump().ok_or_else(|| self.error("unterminated string"))?;
            match c {
                '"' => return Ok(out),
                '\\' => {
                    let e = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
                    match e {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'a' => out.push('\x07'),
                        'b' => out.push('\x08'),
                        'f' => out.push('\x0c'),
                        'v' => out.push('\x0b'),
                        'e' => out.push('\x1b'),
                        'x' => {
                            let start = self.pos;
                            while matches!(self.peek(), Some(h) if h.is_ascii_hexdigit())
                                && self.pos - start < 2
                            {
                                self.bump();
                            }
                            let code = u32::from_str_radix(&self.input[start..self.pos], 16)
                                .map_err(|_| self.error("invalid hex escape"))?;
                            out.push(char::from_u32(code).unwrap_or('?'));
                        }
                        '0'..='7' => {
                            let mut code = e.to_digit(8).unwrap_or(0);
                            for _ in 0..2 {
                                match self.peek().and_then(|d| d.to_digit(8)) {
                                    Some(d) => {
                                        code = code * 8 + d;
                                        self.bump();
                                    }
                                    None => break,
                                }
                            }
                            out.push(char::from_u32(code).unwrap_or('?'));
                        }
                        other => out.push(other),
                    }
                }
                c => out.push(c),
            }
        }
    }
}
