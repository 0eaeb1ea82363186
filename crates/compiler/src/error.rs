//! Compiler error type.
//!
//! A plain enum with a hand-written `Display`, no `thiserror`. All
//! variants are fatal: the first one raised aborts compilation.

use std::fmt;

/// The three fatal error kinds from spec §7, plus I/O.
#[derive(Debug)]
pub enum CompileError {
    /// Malformed token (unterminated string/comment, invalid escape, stray
    /// character).
    Lexer {
        file: String,
        line: u32,
        message: String,
    },
    /// Unexpected token, undeclared identifier, type mismatch,
    /// redeclaration.
    Parse {
        file: String,
        line: u32,
        message: String,
    },
    /// Relocation overflow, unresolved symbol, unsupported construct.
    Codegen { message: String },
    /// Section coalescing, address assignment, or relocation application
    /// failure.
    Link { message: String },
    Io(std::io::Error),
}

impl CompileError {
    pub fn lexer(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        CompileError::Lexer {
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    pub fn parse(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        CompileError::Parse {
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    pub fn codegen(message: impl Into<String>) -> Self {
        CompileError::Codegen {
            message: message.into(),
        }
    }

    pub fn link(message: impl Into<String>) -> Self {
        CompileError::Link {
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Lexer { file, line, message } => {
                write!(f, "{}:{}: {}", file, line, message)
            }
            CompileError::Parse { file, line, message } => {
                write!(f, "{}:{}: {}", file, line, message)
            }
            CompileError::Codegen { message } => write!(f, "{}", message),
            CompileError::Link { message } => write!(f, "{}", message),
            CompileError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_renders_file_line_message() {
        let e = CompileError::parse("main.c", 12, "expected ';', got '}'");
        assert_eq!(e.to_string(), "main.c:12: expected ';', got '}'");
    }

    #[test]
    fn codegen_error_has_no_location() {
        let e = CompileError::codegen("unresolved symbol 'foo'");
        assert_eq!(e.to_string(), "unresolved symbol 'foo'");
    }
}
