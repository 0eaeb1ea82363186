//! Lexer: source text to token stream with one-token lookahead.

use crate::error::CompileError;
use crate::token::{IntSuffix, Token, TokenKind, keyword};

pub struct Lexer<'a> {
    file: String,
    src: &'a [u8],
    pos: usize,
    line: u32,
    peeked: Option<Token>,
    /// Second lookahead slot, filled on demand by `peek_second_token` for
    /// the parser's cast-vs-parenthesized-expression disambiguation: the token right after an already-peeked `(` needs to be
    /// inspected without consuming either one.
    peeked2: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(file: impl Into<String>, source: &'a str) -> Self {
        Lexer {
            file: file.into(),
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            peeked: None,
            peeked2: None,
        }
    }

    pub fn peek_token(&mut self) -> Result<Token, CompileError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.scan_token()?);
        }
        Ok(self.peeked.clone().unwrap())
    }

    pub fn peek_second_token(&mut self) -> Result<Token, CompileError> {
        self.peek_token()?;
        if self.peeked2.is_none() {
            self.peeked2 = Some(self.scan_token()?);
        }
        Ok(self.peeked2.clone().unwrap())
    }

    pub fn next_token(&mut self) -> Result<Token, CompileError> {
        if let Some(t) = self.peeked.take() {
            self.peeked = self.peeked2.take();
            return Ok(t);
        }
        self.scan_token()
    }

    fn cur(&self) -> u8 {
        *self.src.get(self.pos).unwrap_or(&0)
    }

    fn at(&self, off: usize) -> u8 {
        *self.src.get(self.pos + off).unwrap_or(&0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.cur();
        if c != 0 {
            self.pos += 1;
            if c == b'\n' {
                self.line += 1;
            }
        }
        c
    }

    fn eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::lexer(self.file.clone(), self.line, message)
    }

    fn skip_trivia(&mut self) -> Result<(), CompileError> {
        loop {
            match self.cur() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b'/' if self.at(1) == b'/' => {
                    while !self.eof() && self.cur() != b'\n' {
                        self.bump();
                    }
                }
                b'/' if self.at(1) == b'*' => {
                    let start_line = self.line;
                    self.bump();
                    self.bump();
                    loop {
                        if self.eof() {
                            return Err(
                                self.err(format!("unterminated /* comment (started at line {})", start_line))
                            );
                        }
                        if self.cur() == b'*' && self.at(1) == b'/' {
                            self.bump();
                            self.bump();
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan_token(&mut self) -> Result<Token, CompileError> {
        self.skip_trivia()?;
        let line = self.line;
        let start = self.pos;

        if self.eof() {
            return Ok(Token::new(TokenKind::Eof, start, 0, line));
        }

        let c = self.cur();

        if is_ident_start(c) {
            return self.scan_identifier(start, line);
        }
        if c.is_ascii_digit() || (c == b'.' && self.at(1).is_ascii_digit()) {
            return self.scan_number(start, line);
        }
        if c == b'"' {
            return self.scan_string(start, line);
        }
        if c == b'\'' {
            return self.scan_char(start, line);
        }
        self.scan_punct(start, line)
    }

    fn scan_identifier(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        while is_ident_continue(self.cur()) {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        let kind = keyword(text).unwrap_or_else(|| TokenKind::Identifier(text.to_string()));
        Ok(Token::new(kind, start, self.pos - start, line))
    }

    fn scan_number(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        let mut is_float = false;
        if self.cur() == b'0' && (self.at(1) == b'x' || self.at(1) == b'X') {
            self.bump();
            self.bump();
            let digits_start = self.pos;
            while self.cur().is_ascii_hexdigit() {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[digits_start..self.pos]).unwrap();
            let value = i64::from_str_radix(text, 16)
                .map_err(|_| self.err("invalid hexadecimal integer literal"))?;
            let suffix = self.scan_int_suffix();
            return Ok(Token::new(
                TokenKind::Int(value, suffix),
                start,
                self.pos - start,
                line,
            ));
        }
        if self.cur() == b'0' && self.at(1).is_ascii_digit() {
            self.bump();
            let digits_start = self.pos;
            while (b'0'..=b'7').contains(&self.cur()) {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[digits_start..self.pos]).unwrap();
            let value = if text.is_empty() {
                0
            } else {
                i64::from_str_radix(text, 8).map_err(|_| self.err("invalid octal integer literal"))?
            };
            let suffix = self.scan_int_suffix();
            return Ok(Token::new(
                TokenKind::Int(value, suffix),
                start,
                self.pos - start,
                line,
            ));
        }

        while self.cur().is_ascii_digit() {
            self.bump();
        }
        if self.cur() == b'.' {
            is_float = true;
            self.bump();
            while self.cur().is_ascii_digit() {
                self.bump();
            }
        }
        if self.cur() == b'e' || self.cur() == b'E' {
            is_float = true;
            self.bump();
            if self.cur() == b'+' || self.cur() == b'-' {
                self.bump();
            }
            while self.cur().is_ascii_digit() {
                self.bump();
            }
        }

        if is_float {
            // Consume (but ignore) a trailing `f`/`F`/`l`/`L` float suffix.
            if matches!(self.cur(), b'f' | b'F' | b'l' | b'L') {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            let trimmed = text.trim_end_matches(['f', 'F', 'l', 'L']);
            let value: f64 = trimmed
                .parse()
                .map_err(|_| self.err("invalid floating-point literal"))?;
            Ok(Token::new(TokenKind::Float(value), start, self.pos - start, line))
        } else {
            let digits_start = start;
            let digits_end_before_suffix = self.pos;
            let suffix = self.scan_int_suffix();
            let text =
                std::str::from_utf8(&self.src[digits_start..digits_end_before_suffix]).unwrap();
            let value: i64 = text
                .parse()
                .map_err(|_| self.err("invalid decimal integer literal"))?;
            Ok(Token::new(
                TokenKind::Int(value, suffix),
                start,
                self.pos - start,
                line,
            ))
        }
    }

    fn scan_int_suffix(&mut self) -> IntSuffix {
        let mut suffix = IntSuffix::default();
        loop {
            match self.cur() {
                b'u' | b'U' => {
                    suffix.unsigned = true;
                    self.bump();
                }
                b'l' | b'L' => {
                    suffix.long = (suffix.long + 1).min(2);
                    self.bump();
                }
                _ => break,
            }
        }
        suffix
    }

    fn scan_string(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            if self.eof() {
                return Err(self.err("unterminated string literal"));
            }
            match self.bump() {
                b'"' => break,
                b'\\' => value.push(self.scan_escape()? as u8 as char),
                b'\n' => return Err(self.err("unterminated string literal (newline in literal)")),
                c => value.push(c as char),
            }
        }
        Ok(Token::new(TokenKind::Str(value), start, self.pos - start, line))
    }

    fn scan_char(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        self.bump(); // opening quote
        if self.eof() {
            return Err(self.err("unterminated character literal"));
        }
        let value = if self.cur() == b'\\' {
            self.bump();
            self.scan_escape()?
        } else {
            self.bump() as i64
        };
        if self.cur() != b'\'' {
            return Err(self.err("unterminated character literal"));
        }
        self.bump();
        Ok(Token::new(TokenKind::Char(value), start, self.pos - start, line))
    }

    /// Escape set from spec §4.1: `\n \t \r \\ \" \' \0 \xHH`.
    fn scan_escape(&mut self) -> Result<i64, CompileError> {
        if self.eof() {
            return Err(self.err("unterminated escape sequence"));
        }
        let c = self.bump();
        Ok(match c {
            b'n' => b'\n' as i64,
            b't' => b'\t' as i64,
            b'r' => b'\r' as i64,
            b'\\' => b'\\' as i64,
            b'"' => b'"' as i64,
            b'\'' => b'\'' as i64,
            b'0' => 0,
            b'x' => {
                let digits_start = self.pos;
                while self.cur().is_ascii_hexdigit() {
                    self.bump();
                }
                if self.pos == digits_start {
                    return Err(self.err("\\x escape with no following hex digits"));
                }
                let text = std::str::from_utf8(&self.src[digits_start..self.pos]).unwrap();
                i64::from_str_radix(text, 16).unwrap()
            }
            other => {
                return Err(self.err(format!(
                    "invalid escape sequence '\\{}'",
                    other as char
                )));
            }
        })
    }

    fn scan_punct(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        use TokenKind::*;
        macro_rules! tok {
            ($kind:expr, $len:expr) => {{
                for _ in 0..$len {
                    self.bump();
                }
                Ok(Token::new($kind, start, self.pos - start, line))
            }};
        }
        match (self.cur(), self.at(1), self.at(2)) {
            (b'.', b'.', b'.') => tok!(Ellipsis, 3),
            (b'<', b'<', b'=') => tok!(ShlAssign, 3),
            (b'>', b'>', b'=') => tok!(ShrAssign, 3),
            (b'+', b'+', _) => tok!(PlusPlus, 2),
            (b'-', b'-', _) => tok!(MinusMinus, 2),
            (b'-', b'>', _) => tok!(Arrow, 2),
            (b'<', b'<', _) => tok!(Shl, 2),
            (b'>', b'>', _) => tok!(Shr, 2),
            (b'<', b'=', _) => tok!(Le, 2),
            (b'>', b'=', _) => tok!(Ge, 2),
            (b'=', b'=', _) => tok!(EqEq, 2),
            (b'!', b'=', _) => tok!(Ne, 2),
            (b'&', b'&', _) => tok!(AmpAmp, 2),
            (b'|', b'|', _) => tok!(PipePipe, 2),
            (b'+', b'=', _) => tok!(PlusAssign, 2),
            (b'-', b'=', _) => tok!(MinusAssign, 2),
            (b'*', b'=', _) => tok!(StarAssign, 2),
            (b'/', b'=', _) => tok!(SlashAssign, 2),
            (b'%', b'=', _) => tok!(PercentAssign, 2),
            (b'&', b'=', _) => tok!(AmpAssign, 2),
            (b'|', b'=', _) => tok!(PipeAssign, 2),
            (b'^', b'=', _) => tok!(CaretAssign, 2),
            (b'(', _, _) => tok!(LParen, 1),
            (b')', _, _) => tok!(RParen, 1),
            (b'{', _, _) => tok!(LBrace, 1),
            (b'}', _, _) => tok!(RBrace, 1),
            (b'[', _, _) => tok!(LBracket, 1),
            (b']', _, _) => tok!(RBracket, 1),
            (b',', _, _) => tok!(Comma, 1),
            (b';', _, _) => tok!(Semicolon, 1),
            (b':', _, _) => tok!(Colon, 1),
            (b'?', _, _) => tok!(Question, 1),
            (b'.', _, _) => tok!(Dot, 1),
            (b'+', _, _) => tok!(Plus, 1),
            (b'-', _, _) => tok!(Minus, 1),
            (b'*', _, _) => tok!(Star, 1),
            (b'/', _, _) => tok!(Slash, 1),
            (b'%', _, _) => tok!(Percent, 1),
            (b'<', _, _) => tok!(Lt, 1),
            (b'>', _, _) => tok!(Gt, 1),
            (b'&', _, _) => tok!(Amp, 1),
            (b'|', _, _) => tok!(Pipe, 1),
            (b'^', _, _) => tok!(Caret, 1),
            (b'~', _, _) => tok!(Tilde, 1),
            (b'!', _, _) => tok!(Bang, 1),
            (b'=', _, _) => tok!(Assign, 1),
            (other, _, _) => Err(self.err(format!(
                "stray character '{}' outside the recognized alphabet",
                other as char
            ))),
        }
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new("t.c", src);
        let mut out = Vec::new();
        loop {
            let t = lexer.next_token().unwrap();
            if t.is_eof() {
                break;
            }
            out.push(t.kind);
        }
        out
    }

    #[test]
    fn skips_line_and_block_comments() {
        let ks = kinds("int x; // comment\n/* block */ int y;");
        assert_eq!(ks.len(), 8);
    }

    #[test]
    fn hex_and_octal_literals() {
        assert_eq!(kinds("0x2A"), vec![TokenKind::Int(42, IntSuffix::default())]);
        assert_eq!(kinds("052"), vec![TokenKind::Int(42, IntSuffix::default())]);
    }

    #[test]
    fn integer_suffixes_recorded_not_kind_changing() {
        let ks = kinds("42ULL");
        match &ks[0] {
            TokenKind::Int(42, suffix) => {
                assert!(suffix.unsigned);
                assert_eq!(suffix.long, 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn float_literal_requires_dot_or_exponent() {
        assert_eq!(kinds("3.14"), vec![TokenKind::Float(3.14)]);
        assert_eq!(kinds("1e10"), vec![TokenKind::Float(1e10)]);
        assert_eq!(kinds("42"), vec![TokenKind::Int(42, IntSuffix::default())]);
    }

    #[test]
    fn string_escape_set() {
        let ks = kinds(r#""a\nb\t\x41""#);
        assert_eq!(ks, vec![TokenKind::Str("a\nb\tA".to_string())]);
    }

    #[test]
    fn unterminated_string_is_fatal() {
        let mut lexer = Lexer::new("t.c", "\"abc");
        assert!(lexer.next_token().is_err());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lexer = Lexer::new("t.c", "int x;");
        let peeked = lexer.peek_token().unwrap();
        let next = lexer.next_token().unwrap();
        assert_eq!(peeked.kind, next.kind);
    }

    #[test]
    fn compound_and_shift_operators() {
        assert_eq!(
            kinds("<<= >>= += -= ->"),
            vec![
                TokenKind::ShlAssign,
                TokenKind::ShrAssign,
                TokenKind::PlusAssign,
                TokenKind::MinusAssign,
                TokenKind::Arrow,
            ]
        );
    }

    #[test]
    fn stray_character_is_fatal() {
        let mut lexer = Lexer::new("t.c", "$");
        assert!(lexer.next_token().is_err());
    }

    #[test]
    fn peek_second_token_does_not_disturb_first() {
        let mut lexer = Lexer::new("t.c", "( int )");
        let first = lexer.peek_token().unwrap();
        let second = lexer.peek_second_token().unwrap();
        assert_eq!(first.kind, TokenKind::LParen);
        assert_eq!(second.kind, TokenKind::Int_);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::LParen);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Int_);
    }
}
