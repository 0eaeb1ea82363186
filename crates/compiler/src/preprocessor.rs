//! C-style text preprocessor.
//!
//! Operates on text and re-lexes, per spec §9's explicit instruction to
//! keep the coarser text-based contract "for fidelity to the existing test
//! suite, especially the fixed-point property" rather than building a
//! token-stream preprocessor.

use crate::config::CompilerConfig;
use crate::error::CompileError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
enum MacroBody {
    Object(String),
    Function { params: Vec<String>, variadic: bool, body: String },
}

#[derive(Debug, Clone)]
struct MacroDef {
    body: MacroBody,
}

struct CondFrame {
    /// Whether text under this frame is currently emitted.
    active: bool,
    /// Whether *this* frame's own condition (not an ancestor's) has ever
    /// been true, so a later `#elif`/`#else` knows not to re-enter.
    ever_taken: bool,
    /// Whether every enclosing frame is active; `active` is only
    /// meaningful when this is true.
    parent_active: bool,
}

pub struct Preprocessor<'a> {
    config: &'a CompilerConfig,
    macros: HashMap<String, MacroDef>,
    /// Names currently being expanded, to block self-recursive expansion
    ///.
    expanding: Vec<String>,
}

impl<'a> Preprocessor<'a> {
    pub fn new(config: &'a CompilerConfig) -> Self {
        let mut macros = HashMap::new();
        if config.target.is_windows() {
            macros.insert(
                "_WIN32".to_string(),
                MacroDef { body: MacroBody::Object("1".to_string()) },
            );
        } else {
            macros.insert(
                "__linux__".to_string(),
                MacroDef { body: MacroBody::Object("1".to_string()) },
            );
        }
        for (name, value) in &config.defines {
            macros.insert(
                name.clone(),
                MacroDef { body: MacroBody::Object(value.clone().unwrap_or_else(|| "1".to_string())) },
            );
        }
        Preprocessor {
            config,
            macros,
            expanding: Vec::new(),
        }
    }

    /// Preprocess `source` (the contents of `file`), returning the
    /// substituted text with `#` directive lines removed.
    pub fn preprocess(&mut self, file: &Path, source: &str) -> Result<String, CompileError> {
        let mut out = String::with_capacity(source.len());
        self.process_lines(file, source, &mut out, &mut Vec::new())?;
        Ok(out)
    }

    fn active(&self, stack: &[CondFrame]) -> bool {
        stack.iter().all(|f| f.parent_active && f.active)
    }

    fn process_lines(
        &mut self,
        file: &Path,
        source: &str,
        out: &mut String,
        cond_stack: &mut Vec<CondFrame>,
    ) -> Result<(), CompileError> {
        let file_str = file.display().to_string();
        let mut line_no: u32 = 0;
        let mut lines = source.lines().peekable();
        while let Some(raw_line) = lines.next() {
            line_no += 1;
            let line = raw_line.trim_start();
            if let Some(directive) = line.strip_prefix('#') {
                self.handle_directive(
                    directive.trim(),
                    &file_str,
                    line_no,
                    file,
                    cond_stack,
                    out,
                )?;
                continue;
            }
            if self.active(cond_stack) {
                let expanded = self.expand_line(raw_line, &file_str, line_no)?;
                out.push_str(&expanded);
                out.push('\n');
            } else {
                out.push('\n'); // preserve line numbers under inactive branches
            }
        }
        if !cond_stack.is_empty() {
            return Err(CompileError::parse(
                file_str,
                line_no,
                "unterminated #if/#ifdef at end of file",
            ));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_directive(
        &mut self,
        directive: &str,
        file_str: &str,
        line_no: u32,
        file: &Path,
        cond_stack: &mut Vec<CondFrame>,
        out: &mut String,
    ) -> Result<(), CompileError> {
        let (keyword, rest) = split_directive(directive);
        let currently_active = self.active(cond_stack);

        match keyword {
            "include" if currently_active => {
                let included = self.resolve_include(rest.trim(), file, file_str, line_no)?;
                let text = included.1;
                self.process_lines(&included.0, &text, out, &mut Vec::new())?;
            }
            "include" => {}
            "define" if currently_active => {
                self.handle_define(rest.trim(), file_str, line_no)?;
            }
            "define" => {}
            "undef" if currently_active => {
                self.macros.remove(rest.trim());
            }
            "undef" => {}
            "pragma" if currently_active => {
                self.handle_pragma(rest.trim(), out);
            }
            "pragma" => {}
            "error" if currently_active => {
                return Err(CompileError::parse(
                    file_str,
                    line_no,
                    format!("#error {}", rest.trim()),
                ));
            }
            "error" => {}
            "ifdef" => {
                let defined = self.macros.contains_key(rest.trim());
                cond_stack.push(CondFrame {
                    active: defined,
                    ever_taken: defined,
                    parent_active: currently_active,
                });
            }
            "ifndef" => {
                let defined = self.macros.contains_key(rest.trim());
                cond_stack.push(CondFrame {
                    active: !defined,
                    ever_taken: !defined,
                    parent_active: currently_active,
                });
            }
            "if" => {
                let taken = currently_active
                    && self.eval_condition(rest.trim(), file_str, line_no)?;
                cond_stack.push(CondFrame {
                    active: taken,
                    ever_taken: taken,
                    parent_active: currently_active,
                });
            }
            "elif" => {
                let frame = cond_stack.last_mut().ok_or_else(|| {
                    CompileError::parse(file_str, line_no, "#elif without #if")
                })?;
                if frame.ever_taken || !frame.parent_active {
                    frame.active = false;
                } else {
                    let taken = self.eval_condition(rest.trim(), file_str, line_no)?;
                    frame.active = taken;
                    frame.ever_taken = taken;
                }
            }
            "else" => {
                let frame = cond_stack.last_mut().ok_or_else(|| {
                    CompileError::parse(file_str, line_no, "#else without #if")
                })?;
                frame.active = !frame.ever_taken && frame.parent_active;
                frame.ever_taken = true;
            }
            "endif" => {
                if cond_stack.pop().is_none() {
                    return Err(CompileError::parse(file_str, line_no, "#endif without #if"));
                }
            }
            "" => {}
            other => {
                if currently_active {
                    return Err(CompileError::parse(
                        file_str,
                        line_no,
                        format!("unknown preprocessor directive '#{}'", other),
                    ));
                }
            }
        }
        Ok(())
    }

    /// `#pragma` lines are not valid C tokens, so they can't survive
    /// directly into the output the parser re-lexes. Forward recognized
    /// pragmas as `_Pragma("...")`, a real C token sequence the parser
    /// already knows how to call back into `TypeTable::pragma_pack*` with.
    fn handle_pragma(&mut self, rest: &str, out: &mut String) {
        if rest.starts_with("pack") {
            out.push_str(&format!("_Pragma(\"{}\");\n", escape_pragma(rest)));
        }
    }

    fn handle_define(&mut self, rest: &str, file_str: &str, line_no: u32) -> Result<(), CompileError> {
        let rest = rest.trim_start();
        let name_end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if name_end == 0 {
            return Err(CompileError::parse(file_str, line_no, "#define missing macro name"));
        }
        let name = rest[..name_end].to_string();
        let after_name = &rest[name_end..];

        if let Some(paren_body) = after_name.strip_prefix('(') {
            // Function-like macro: no space between name and `(`.
            let close = paren_body.find(')').ok_or_else(|| {
                CompileError::parse(file_str, line_no, "unterminated macro parameter list")
            })?;
            let param_list = &paren_body[..close];
            let body = paren_body[close + 1..].trim_start().to_string();
            let mut variadic = false;
            let mut params: Vec<String> = Vec::new();
            for p in param_list.split(',') {
                let p = p.trim();
                if p.is_empty() {
                    continue;
                }
                if p == "..." {
                    variadic = true;
                } else {
                    params.push(p.to_string());
                }
            }
            self.macros.insert(
                name,
                MacroDef { body: MacroBody::Function { params, variadic, body } },
            );
        } else {
            let body = after_name.trim_start().to_string();
            self.macros.insert(name, MacroDef { body: MacroBody::Object(body) });
        }
        Ok(())
    }

    fn resolve_include(
        &self,
        spec: &str,
        including_file: &Path,
        file_str: &str,
        line_no: u32,
    ) -> Result<(PathBuf, String), CompileError> {
        let (name, is_system) = if let Some(n) = spec.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            (n, false)
        } else if let Some(n) = spec.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
            (n, true)
        } else {
            return Err(CompileError::parse(
                file_str,
                line_no,
                format!("malformed #include '{}'", spec),
            ));
        };

        let mut candidates = Vec::new();
        if !is_system {
            if let Some(parent) = including_file.parent() {
                candidates.push(parent.join(name));
            } else {
                candidates.push(PathBuf::from(name));
            }
        }
        for dir in &self.config.include_dirs {
            candidates.push(dir.join(name));
        }

        for candidate in &candidates {
            if let Ok(text) = std::fs::read_to_string(candidate) {
                return Ok((candidate.clone(), text));
            }
        }
        Err(CompileError::parse(
            file_str,
            line_no,
            format!("cannot find include file '{}'", name),
        ))
    }

    /// `#if` constant-expression evaluator: `+ - * / % << >>` plus
    /// `defined(X)`, over integer literals and macro names.
    fn eval_condition(&mut self, expr: &str, file_str: &str, line_no: u32) -> Result<bool, CompileError> {
        let substituted = self.substitute_defined(expr);
        let expanded = self.expand_line(&substituted, file_str, line_no)?;
        let mut parser = CondExprParser::new(&expanded);
        let value = parser
            .parse_expr()
            .ok_or_else(|| CompileError::parse(file_str, line_no, format!("malformed #if expression '{}'", expr)))?;
        Ok(value != 0)
    }

    fn substitute_defined(&self, expr: &str) -> String {
        let mut out = String::new();
        let bytes = expr.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if expr[i..].starts_with("defined") {
                let mut j = i + "defined".len();
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                let has_paren = j < bytes.len() && bytes[j] == b'(';
                if has_paren {
                    j += 1;
                }
                let name_start = j;
                while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                    j += 1;
                }
                let name = &expr[name_start..j];
                if has_paren {
                    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j] == b')' {
                        j += 1;
                    }
                }
                out.push_str(if self.macros.contains_key(name) { "1" } else { "0" });
                i = j;
            } else {
                out.push(expr.as_bytes()[i] as char);
                i += 1;
            }
        }
        out
    }

    /// Expand all macro invocations on one logical line. One pass of
    /// rescanning: arguments are substituted unexpanded, then the result is
    /// re-tokenized once more.
    fn expand_line(&mut self, line: &str, file_str: &str, line_no: u32) -> Result<String, CompileError> {
        self.expand_text(line, file_str, line_no, 0)
    }

    fn expand_text(
        &mut self,
        text: &str,
        file_str: &str,
        line_no: u32,
        depth: u32,
    ) -> Result<String, CompileError> {
        if depth > 64 {
            return Err(CompileError::parse(file_str, line_no, "macro expansion too deeply nested"));
        }
        let mut out = String::with_capacity(text.len());
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if c == b'"' {
                // Don't expand inside string literals.
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
                out.push_str(&text[start..i]);
                continue;
            }
            if is_ident_start(c) {
                let start = i;
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                let name = &text[start..i];
                if let Some(expansion) =
                    self.try_expand_ident(name, text, &mut i, file_str, line_no, depth)?
                {
                    out.push_str(&expansion);
                } else {
                    out.push_str(name);
                }
                continue;
            }
            out.push(c as char);
            i += 1;
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn try_expand_ident(
        &mut self,
        name: &str,
        text: &str,
        pos: &mut usize,
        file_str: &str,
        line_no: u32,
        depth: u32,
    ) -> Result<Option<String>, CompileError> {
        if name == "__FILE__" {
            return Ok(Some(format!("\"{}\"", file_str)));
        }
        if name == "__LINE__" {
            return Ok(Some(line_no.to_string()));
        }
        if self.expanding.iter().any(|n| n == name) {
            return Ok(None); // blocked self-recursion
        }
        let Some(def) = self.macros.get(name).cloned() else {
            return Ok(None);
        };
        match def.body {
            MacroBody::Object(body) => {
                self.expanding.push(name.to_string());
                let expanded = self.expand_text(&body, file_str, line_no, depth + 1)?;
                self.expanding.pop();
                Ok(Some(expanded))
            }
            MacroBody::Function { params, variadic, body } => {
                let bytes = text.as_bytes();
                let mut j = *pos;
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j >= bytes.len() || bytes[j] != b'(' {
                    // Not actually invoked here; leave the identifier as-is.
                    return Ok(None);
                }
                let (args, after) = scan_call_args(text, j)?;
                *pos = after;
                let substituted = substitute_params(&body, &params, &args, variadic);
                self.expanding.push(name.to_string());
                let expanded = self.expand_text(&substituted, file_str, line_no, depth + 1)?;
                self.expanding.pop();
                Ok(Some(expanded))
            }
        }
    }
}

/// `_Pragma` takes an ordinary string literal, so embedded quotes and
/// backslashes from the directive text need the usual C escaping.
fn escape_pragma(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}
fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn split_directive(directive: &str) -> (&str, &str) {
    let end = directive
        .find(|c: char| c.is_whitespace())
        .unwrap_or(directive.len());
    (&directive[..end], &directive[end..])
}

/// Scan a parenthesized, comma-separated argument list starting at `start`
/// (the index of the opening `(`). Returns the raw argument texts and the
/// index just past the closing `)`.
fn scan_call_args(text: &str, start: usize) -> Result<(Vec<String>, usize), CompileError> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut i = start;
    let mut args = Vec::new();
    let mut current = String::new();
    loop {
        if i >= bytes.len() {
            return Err(CompileError::parse("<macro>", 0, "unterminated macro invocation"));
        }
        let c = bytes[i];
        match c {
            b'(' => {
                depth += 1;
                if depth > 1 {
                    current.push('(');
                }
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    if !current.trim().is_empty() || !args.is_empty() {
                        args.push(current.trim().to_string());
                    }
                    i += 1;
                    break;
                }
                current.push(')');
            }
            b',' if depth == 1 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c as char),
        }
        i += 1;
    }
    Ok((args, i))
}

/// Text-substitute macro parameters into the replacement body. Arguments
/// are not individually pre-expanded.
fn substitute_params(body: &str, params: &[String], args: &[String], variadic: bool) -> String {
    let mut out = String::with_capacity(body.len());
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if is_ident_start(bytes[i]) {
            let start = i;
            while i < bytes.len() && is_ident_continue(bytes[i]) {
                i += 1;
            }
            let word = &body[start..i];
            if word == "__VA_ARGS__" && variadic {
                let extra = if args.len() > params.len() {
                    args[params.len()..].join(", ")
                } else {
                    String::new()
                };
                out.push_str(&extra);
                continue;
            }
            if let Some(idx) = params.iter().position(|p| p == word) {
                out.push_str(args.get(idx).map(String::as_str).unwrap_or(""));
            } else {
                out.push_str(word);
            }
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

/// Minimal recursive-descent evaluator for `#if` constant expressions:
/// `+ - * / % << >>` over decimal integers, already reduced to 0/1 for
/// `defined(...)`.
struct CondExprParser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> CondExprParser<'a> {
    fn new(text: &'a str) -> Self {
        CondExprParser { text, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.text.len() && self.text.as_bytes()[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.skip_ws();
        self.text[self.pos..].chars().next()
    }

    fn parse_expr(&mut self) -> Option<i64> {
        self.parse_shift()
    }

    fn parse_shift(&mut self) -> Option<i64> {
        let mut lhs = self.parse_additive()?;
        loop {
            self.skip_ws();
            if self.text[self.pos..].starts_with("<<") {
                self.pos += 2;
                let rhs = self.parse_additive()?;
                lhs = lhs.wrapping_shl(rhs as u32);
            } else if self.text[self.pos..].starts_with(">>") {
                self.pos += 2;
                let rhs = self.parse_additive()?;
                lhs = lhs.wrapping_shr(rhs as u32);
            } else {
                break;
            }
        }
        Some(lhs)
    }

    fn parse_additive(&mut self) -> Option<i64> {
        let mut lhs = self.parse_mul()?;
        loop {
            match self.peek_char() {
                Some('+') => {
                    self.pos += 1;
                    lhs = lhs.wrapping_add(self.parse_mul()?);
                }
                Some('-') => {
                    self.pos += 1;
                    lhs = lhs.wrapping_sub(self.parse_mul()?);
                }
                _ => break,
            }
        }
        Some(lhs)
    }

    fn parse_mul(&mut self) -> Option<i64> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.peek_char() {
                Some('*') => {
                    self.pos += 1;
                    lhs = lhs.wrapping_mul(self.parse_unary()?);
                }
                Some('/') => {
                    self.pos += 1;
                    let rhs = self.parse_unary()?;
                    lhs = if rhs == 0 { 0 } else { lhs.wrapping_div(rhs) };
                }
                Some('%') => {
                    self.pos += 1;
                    let rhs = self.parse_unary()?;
                    lhs = if rhs == 0 { 0 } else { lhs.wrapping_rem(rhs) };
                }
                _ => break,
            }
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<i64> {
        match self.peek_char() {
            Some('-') => {
                self.pos += 1;
                Some(self.parse_unary()?.wrapping_neg())
            }
            Some('!') => {
                self.pos += 1;
                Some(if self.parse_unary()? == 0 { 1 } else { 0 })
            }
            Some('(') => {
                self.pos += 1;
                let v = self.parse_expr()?;
                self.skip_ws();
                if self.peek_char() == Some(')') {
                    self.pos += 1;
                }
                Some(v)
            }
            _ => self.parse_number(),
        }
    }

    fn parse_number(&mut self) -> Option<i64> {
        self.skip_ws();
        let start = self.pos;
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && (bytes[self.pos].is_ascii_alphanumeric() || bytes[self.pos] == b'x') {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        let text = self.text[start..self.pos].trim_end_matches(['u', 'U', 'l', 'L']);
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).ok()
        } else {
            text.parse().ok().or(Some(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn pp(source: &str) -> String {
        let config = CompilerConfig::default();
        let mut p = Preprocessor::new(&config);
        p.preprocess(Path::new("t.c"), source).unwrap()
    }

    #[test]
    fn identity_on_input_without_directives() {
        let src = "int main(){return 42;}\n";
        assert_eq!(pp(src).trim_end(), src.trim_end());
    }

    #[test]
    fn object_macro_expansion() {
        let src = "#define N 42\nint x = N;\n";
        assert_eq!(pp(src).trim(), "\nint x = 42;");
    }

    #[test]
    fn function_macro_expansion() {
        let src = "#define SQ(x) ((x)*(x))\nint y = SQ(6)+SQ(1);\n";
        assert_eq!(pp(src).trim(), "\nint y = ((6)*(6))+((1)*(1));");
    }

    #[test]
    fn self_recursion_is_blocked() {
        let src = "#define A A + 1\nint x = A;\n";
        let out = pp(src);
        assert!(out.contains("A + 1"));
    }

    #[test]
    fn ifdef_ifndef_else_endif() {
        let src = "#ifdef FOO\nint a;\n#else\nint b;\n#endif\n";
        let out = pp(src);
        assert!(out.contains("int b;"));
        assert!(!out.contains("int a;"));
    }

    #[test]
    fn if_elif_else_chain_picks_first_true() {
        let src = "#if 0\nint a;\n#elif 1\nint b;\n#else\nint c;\n#endif\n";
        let out = pp(src);
        assert!(out.contains("int b;"));
        assert!(!out.contains("int a;"));
        assert!(!out.contains("int c;"));
    }

    #[test]
    fn defined_operator() {
        let src = "#define FOO 1\n#if defined(FOO)\nint a;\n#endif\n";
        assert!(pp(src).contains("int a;"));
    }

    #[test]
    fn builtin_line_and_file() {
        let src = "int l = __LINE__;\n";
        assert!(pp(src).contains("int l = 1;"));
    }

    #[test]
    fn pragma_pack_is_forwarded_as_a_pragma_call() {
        let src = "#pragma pack(1)\nstruct P { char a; int b; };\n";
        let out = pp(src);
        assert!(out.contains("_Pragma(\"pack(1)\");"));
    }

    #[test]
    fn unrecognized_pragma_produces_no_marker() {
        let src = "#pragma once\nint x;\n";
        let out = pp(src);
        assert!(!out.contains("_Pragma"));
    }

    #[test]
    fn error_directive_is_fatal() {
        let config = CompilerConfig::default();
        let mut p = Preprocessor::new(&config);
        let err = p.preprocess(Path::new("t.c"), "#error boom\n").unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
