//! Recursive-descent parser with precedence climbing.
//!
//! `Parser` holds a flat `{ tokens, pos }` cursor over the token stream.
//! Declarations and statements are parsed by explicit per-keyword dispatch
//! on `self.check("keyword")`.

use crate::ast::*;
use crate::error::CompileError;
use crate::lexer::Lexer;
use crate::token::TokenKind;
use crate::types::{TypeId, TypeKind, TypeTable};
use fixc_core::Target;
use std::collections::HashMap;

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    file: String,
    pub types: TypeTable,
    typedefs: HashMap<String, TypeId>,
    struct_tags: HashMap<String, TypeId>,
    union_tags: HashMap<String, TypeId>,
    enum_constants: HashMap<String, i64>,
    functions: HashMap<String, TypeId>,
    globals: HashMap<String, TypeId>,
    /// Block-scoped variable tables, innermost last. File-scope names live
    /// in `globals` instead, since they outlive every function body.
    scopes: Vec<HashMap<String, TypeId>>,
}

impl<'a> Parser<'a> {
    pub fn new(file: impl Into<String>, source: &'a str, target: Target) -> Self {
        let file = file.into();
        Parser {
            lexer: Lexer::new(file.clone(), source),
            file,
            types: TypeTable::new(target),
            typedefs: HashMap::new(),
            struct_tags: HashMap::new(),
            union_tags: HashMap::new(),
            enum_constants: HashMap::new(),
            functions: HashMap::new(),
            globals: HashMap::new(),
            scopes: Vec::new(),
        }
    }

    pub fn parse(&mut self) -> Result<Program, CompileError> {
        let mut program = Program::new();
        while !self.peek()?.is_eof() {
            if self.try_consume_pragma()? {
                continue;
            }
            self.parse_external_declaration(&mut program)?;
        }
        Ok(program)
    }

    /// Recognizes the `_Pragma("...")` marker the preprocessor forwards
    /// `#pragma` lines as, and applies any pack-related pragma it names.
    /// Returns `false` (consuming nothing) for anything else.
    fn try_consume_pragma(&mut self) -> Result<bool, CompileError> {
        let is_pragma = matches!(&self.peek()?.kind, TokenKind::Identifier(name) if name == "_Pragma");
        if !is_pragma {
            return Ok(false);
        }
        self.bump()?; // `_Pragma`
        self.expect(TokenKind::LParen, "'('")?;
        let tok = self.bump()?;
        let line = tok.line;
        let text = match tok.kind {
            TokenKind::Str(s) => s,
            other => return Err(self.err(line, format!("expected a string literal in _Pragma(), got {:?}", other))),
        };
        self.expect(TokenKind::RParen, "')'")?;
        self.expect(TokenKind::Semicolon, "';'")?;
        self.apply_pragma_pack(&text, line)?;
        Ok(true)
    }

    /// The only pragma the preprocessor forwards today is `#pragma pack`;
    /// anything else reaching here is silently ignored, matching a
    /// compiler's usual `#pragma` tolerance.
    fn apply_pragma_pack(&mut self, text: &str, line: u32) -> Result<(), CompileError> {
        let trimmed = text.trim();
        let Some(rest) = trimmed.strip_prefix("pack") else {
            return Ok(());
        };
        let rest = rest.trim();
        let args = rest
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| self.err(line, format!("malformed #pragma pack '{}'", text)))?
            .trim();
        if args.is_empty() {
            return Ok(());
        }
        let mut parts = args.split(',').map(str::trim);
        let first = parts.next().unwrap_or("");
        match first {
            "push" => {
                let n = parts
                    .next()
                    .map(|s| {
                        s.parse::<u32>()
                            .map_err(|_| self.err(line, format!("invalid #pragma pack value '{}'", s)))
                    })
                    .transpose()?;
                self.types.pragma_pack_push(n);
            }
            "pop" => self.types.pragma_pack_pop(),
            n => {
                let value: u32 = n
                    .parse()
                    .map_err(|_| self.err(line, format!("invalid #pragma pack value '{}'", n)))?;
                self.types.pragma_pack(value);
            }
        }
        Ok(())
    }

    // ---- token helpers ----------------------------------------------

    fn peek(&mut self) -> Result<crate::token::Token, CompileError> {
        self.lexer.peek_token()
    }

    fn bump(&mut self) -> Result<crate::token::Token, CompileError> {
        self.lexer.next_token()
    }

    fn err(&self, line: u32, message: impl Into<String>) -> CompileError {
        CompileError::parse(self.file.clone(), line, message)
    }

    fn at(&mut self, kind: TokenKind) -> Result<bool, CompileError> {
        Ok(std::mem::discriminant(&self.peek()?.kind) == std::mem::discriminant(&kind))
    }

    fn eat(&mut self, kind: TokenKind) -> Result<bool, CompileError> {
        if self.at(kind)? {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<crate::token::Token, CompileError> {
        let t = self.bump()?;
        if std::mem::discriminant(&t.kind) == std::mem::discriminant(&kind) {
            Ok(t)
        } else {
            Err(self.err(t.line, format!("expected {}, got {:?}", what, t.kind)))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, u32), CompileError> {
        let t = self.bump()?;
        match t.kind {
            TokenKind::Identifier(name) => Ok((name, t.line)),
            other => Err(self.err(t.line, format!("expected an identifier, got {:?}", other))),
        }
    }

    fn is_type_start(&mut self) -> Result<bool, CompileError> {
        use TokenKind::*;
        let t = self.peek()?;
        Ok(match &t.kind {
            Void | Char_ | Short | Long | Float_ | Double | Int_ | Struct | Union | Enum
            | Unsigned | Signed | Const => true,
            Identifier(name) => self.typedefs.contains_key(name),
            _ => false,
        })
    }

    fn peek_is_type_after_paren(&mut self) -> Result<bool, CompileError> {
        use TokenKind::*;
        let t = self.lexer.peek_second_token()?;
        Ok(match &t.kind {
            Void | Char_ | Short | Long | Float_ | Double | Int_ | Struct | Union | Enum
            | Unsigned | Signed | Const => true,
            Identifier(name) => self.typedefs.contains_key(name),
            _ => false,
        })
    }

    fn lookup_variable(&self, name: &str) -> Option<TypeId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&ty) = scope.get(name) {
                return Some(ty);
            }
        }
        self.globals.get(name).copied()
    }

    // ---- constant folding (array lengths, enum values, case labels) --

    fn const_eval(&self, e: &Expr) -> Result<i64, CompileError> {
        Ok(match e {
            Expr::Integer { value, .. } => *value,
            Expr::Binary { op, lhs, rhs, loc, .. } => {
                let l = self.const_eval(lhs)?;
                let r = self.const_eval(rhs)?;
                match op {
                    BinOp::Add => l.wrapping_add(r),
                    BinOp::Sub => l.wrapping_sub(r),
                    BinOp::Mul => l.wrapping_mul(r),
                    BinOp::Div => {
                        if r == 0 {
                            return Err(self.err(loc.line, "division by zero in constant expression"));
                        }
                        l.wrapping_div(r)
                    }
                    BinOp::Mod => {
                        if r == 0 {
                            return Err(self.err(loc.line, "division by zero in constant expression"));
                        }
                        l.wrapping_rem(r)
                    }
                    BinOp::Shl => l.wrapping_shl(r as u32),
                    BinOp::Shr => l.wrapping_shr(r as u32),
                    _ => return Err(self.err(loc.line, "not a constant expression")),
                }
            }
            Expr::Unary { op, expr, .. } => {
                let v = self.const_eval(expr)?;
                match op {
                    UnaryOp::Neg => v.wrapping_neg(),
                    UnaryOp::Not => {
                        if v == 0 {
                            1
                        } else {
                            0
                        }
                    }
                    UnaryOp::BitNot => !v,
                }
            }
            other => return Err(self.err(other.loc().line, "not a constant expression")),
        })
    }

    // ---- type specifiers and declarators ------------------------------

    fn parse_type_specifier(&mut self) -> Result<TypeId, CompileError> {
        loop {
            match self.peek()?.kind {
                TokenKind::Const | TokenKind::Unsigned | TokenKind::Signed => {
                    self.bump()?;
                }
                _ => break,
            }
        }
        let tok = self.peek()?;
        let line = tok.line;
        let base = match tok.kind {
            TokenKind::Void => {
                self.bump()?;
                self.types.void()
            }
            TokenKind::Char_ => {
                self.bump()?;
                self.types.char_ty()
            }
            TokenKind::Short => {
                self.bump()?;
                self.types.short()
            }
            TokenKind::Int_ => {
                self.bump()?;
                self.types.int()
            }
            TokenKind::Long => {
                self.bump()?;
                if self.eat(TokenKind::Long)? {
                    self.types.long_long()
                } else {
                    self.types.long()
                }
            }
            TokenKind::Float_ => {
                self.bump()?;
                self.types.float()
            }
            TokenKind::Double => {
                self.bump()?;
                self.types.double()
            }
            TokenKind::Struct => {
                self.bump()?;
                self.parse_aggregate(true)?
            }
            TokenKind::Union => {
                self.bump()?;
                self.parse_aggregate(false)?
            }
            TokenKind::Enum => {
                self.bump()?;
                self.parse_enum_body()?
            }
            TokenKind::Identifier(ref name) => {
                if let Some(&id) = self.typedefs.get(name) {
                    self.bump()?;
                    id
                } else {
                    return Err(self.err(line, format!("expected a type, got identifier '{}'", name)));
                }
            }
            other => return Err(self.err(line, format!("expected a type specifier, got {:?}", other))),
        };
        // Trailing qualifiers (`int const`) are accepted but have no effect.
        while self.eat(TokenKind::Const)? {}
        Ok(base)
    }

    fn parse_aggregate(&mut self, is_struct: bool) -> Result<TypeId, CompileError> {
        let tag = if let TokenKind::Identifier(name) = self.peek()?.kind {
            self.bump()?;
            Some(name)
        } else {
            None
        };

        let existing = tag.as_ref().and_then(|t| {
            if is_struct {
                self.struct_tags.get(t).copied()
            } else {
                self.union_tags.get(t).copied()
            }
        });

        if !self.at(TokenKind::LBrace)? {
            if let Some(id) = existing {
                return Ok(id);
            }
            let id = if is_struct {
                self.types.declare_struct(tag.clone())
            } else {
                self.types.declare_union(tag.clone())
            };
            if let Some(t) = tag {
                if is_struct {
                    self.struct_tags.insert(t, id);
                } else {
                    self.union_tags.insert(t, id);
                }
            }
            return Ok(id);
        }

        let id = match existing {
            Some(id) => id,
            None => {
                let id = if is_struct {
                    self.types.declare_struct(tag.clone())
                } else {
                    self.types.declare_union(tag.clone())
                };
                if let Some(t) = tag.clone() {
                    if is_struct {
                        self.struct_tags.insert(t, id);
                    } else {
                        self.union_tags.insert(t, id);
                    }
                }
                id
            }
        };

        self.bump()?; // '{'
        let mut fields = Vec::new();
        while !self.at(TokenKind::RBrace)? {
            let member_base = self.parse_type_specifier()?;
            loop {
                let (name, ty) = self.parse_declarator(member_base)?;
                fields.push((name, ty));
                if !self.eat(TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(TokenKind::Semicolon, "';'")?;
        }
        self.bump()?; // '}'
        if is_struct {
            self.types.complete_struct(id, fields);
        } else {
            self.types.complete_union(id, fields);
        }
        Ok(id)
    }

    fn parse_enum_body(&mut self) -> Result<TypeId, CompileError> {
        if let TokenKind::Identifier(_) = self.peek()?.kind {
            self.bump()?; // enum tags share one underlying 4-byte type
        }
        if !self.at(TokenKind::LBrace)? {
            return Ok(self.types.enum_ty());
        }
        self.bump()?; // '{'
        let mut next_value: i64 = 0;
        while !self.at(TokenKind::RBrace)? {
            let (name, _line) = self.expect_ident()?;
            if self.eat(TokenKind::Assign)? {
                let e = self.parse_assignment()?;
                next_value = self.const_eval(&e)?;
            }
            self.enum_constants.insert(name, next_value);
            next_value += 1;
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(self.types.enum_ty())
    }

    /// Pointer stars, a name, and an optional single array dimension.
    /// Shared by struct-member and variable declarators.
    fn parse_declarator(&mut self, base: TypeId) -> Result<(String, TypeId), CompileError> {
        let mut ty = base;
        while self.eat(TokenKind::Star)? {
            ty = self.types.pointer(ty);
        }
        let (name, _line) = self.expect_ident()?;
        if self.eat(TokenKind::LBracket)? {
            let len = if self.at(TokenKind::RBracket)? {
                0
            } else {
                let e = self.parse_assignment()?;
                self.const_eval(&e)? as u32
            };
            self.expect(TokenKind::RBracket, "']'")?;
            ty = self.types.array(ty, len);
        }
        Ok((name, ty))
    }

    /// Abstract declarator for `sizeof(T)`/`(T)expr` casts: pointer stars
    /// over a base type, no name.
    fn parse_type_name(&mut self) -> Result<TypeId, CompileError> {
        let mut ty = self.parse_type_specifier()?;
        while self.eat(TokenKind::Star)? {
            ty = self.types.pointer(ty);
        }
        Ok(ty)
    }

    // ---- top-level declarations ---------------------------------------

    fn parse_external_declaration(&mut self, program: &mut Program) -> Result<(), CompileError> {
        let is_typedef = self.eat(TokenKind::Typedef)?;
        let mut is_extern = false;
        loop {
            if self.eat(TokenKind::Extern)? {
                is_extern = true;
                continue;
            }
            if self.eat(TokenKind::Static)? {
                continue;
            }
            break;
        }
        let line = self.peek()?.line;
        let base = self.parse_type_specifier()?;

        if self.eat(TokenKind::Semicolon)? {
            return Ok(()); // struct/union/enum tag-only declaration
        }

        loop {
            let mut ty = base;
            while self.eat(TokenKind::Star)? {
                ty = self.types.pointer(ty);
            }
            let (name, _name_line) = self.expect_ident()?;

            if self.at(TokenKind::LParen)? {
                self.bump()?; // '('
                self.scopes.push(HashMap::new());
                let (params, variadic) = self.parse_param_list()?;
                self.expect(TokenKind::RParen, "')'")?;
                let param_tys: Vec<TypeId> = params.iter().map(|p| p.ty).collect();
                let fn_ty = self.types.function(ty, param_tys, variadic);
                self.functions.insert(name.clone(), fn_ty);

                if self.eat(TokenKind::Semicolon)? {
                    self.scopes.pop();
                    program.functions.push(Function {
                        name,
                        ret: ty,
                        params,
                        variadic,
                        body: None,
                        is_extern: true,
                        loc: SourceLocation { line },
                    });
                } else {
                    for p in &params {
                        self.scopes.last_mut().unwrap().insert(p.name.clone(), p.ty);
                    }
                    let body = self.parse_block()?;
                    self.scopes.pop();
                    program.functions.push(Function {
                        name,
                        ret: ty,
                        params,
                        variadic,
                        body: Some(body),
                        is_extern,
                        loc: SourceLocation { line },
                    });
                }
                return Ok(());
            }

            if self.eat(TokenKind::LBracket)? {
                let len = if self.at(TokenKind::RBracket)? {
                    0
                } else {
                    let e = self.parse_assignment()?;
                    self.const_eval(&e)? as u32
                };
                self.expect(TokenKind::RBracket, "']'")?;
                ty = self.types.array(ty, len);
            }

            if is_typedef {
                self.typedefs.insert(name, ty);
            } else {
                let init = if self.eat(TokenKind::Assign)? {
                    Some(self.parse_initializer(ty)?)
                } else {
                    None
                };
                self.globals.insert(name.clone(), ty);
                program.globals.push(Global {
                    name,
                    ty,
                    init,
                    is_extern,
                    loc: SourceLocation { line },
                });
            }

            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(())
    }

    fn parse_param_list(&mut self) -> Result<(Vec<Param>, bool), CompileError> {
        let mut params = Vec::new();
        let mut variadic = false;
        if self.at(TokenKind::RParen)? {
            return Ok((params, variadic));
        }
        if self.at(TokenKind::Void)? && matches!(self.lexer.peek_second_token()?.kind, TokenKind::RParen) {
            self.bump()?; // 'void'
            return Ok((params, variadic));
        }
        loop {
            if self.eat(TokenKind::Ellipsis)? {
                variadic = true;
                break;
            }
            let base = self.parse_type_specifier()?;
            let mut ty = base;
            while self.eat(TokenKind::Star)? {
                ty = self.types.pointer(ty);
            }
            let (name, _line) = self.expect_ident()?;
            params.push(Param { name, ty });
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        Ok((params, variadic))
    }

    // ---- statements -----------------------------------------------------

    fn parse_block(&mut self) -> Result<Stmt, CompileError> {
        self.expect(TokenKind::LBrace, "'{'")?;
        self.scopes.push(HashMap::new());
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace)? {
            stmts.extend(self.parse_block_item()?);
        }
        self.bump()?; // '}'
        self.scopes.pop();
        Ok(Stmt::Block(stmts))
    }

    fn parse_block_item(&mut self) -> Result<Vec<Stmt>, CompileError> {
        if self.try_consume_pragma()? {
            return Ok(Vec::new());
        }
        if self.is_type_start()? {
            self.parse_local_declaration()
        } else {
            Ok(vec![self.parse_statement()?])
        }
    }

    /// `int a = 1, b = 2;` expands to one `Stmt::VarDecl` per declarator
    ///; a bare tag declaration (`struct Foo;`) expands to none.
    fn parse_local_declaration(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let is_typedef = self.eat(TokenKind::Typedef)?;
        while self.eat(TokenKind::Static)? || self.eat(TokenKind::Extern)? {}
        let line = self.peek()?.line;
        let base = self.parse_type_specifier()?;
        let mut out = Vec::new();
        if self.eat(TokenKind::Semicolon)? {
            return Ok(out);
        }
        loop {
            let (name, ty) = self.parse_declarator(base)?;
            if is_typedef {
                self.typedefs.insert(name, ty);
            } else {
                let init = if self.eat(TokenKind::Assign)? {
                    Some(self.parse_initializer(ty)?)
                } else {
                    None
                };
                self.scopes.last_mut().unwrap().insert(name.clone(), ty);
                out.push(Stmt::VarDecl(Declarator {
                    name,
                    ty,
                    init,
                    loc: SourceLocation { line },
                }));
            }
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(out)
    }

    fn parse_statement(&mut self) -> Result<Stmt, CompileError> {
        let tok = self.peek()?;
        match tok.kind {
            TokenKind::LBrace => self.parse_block(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Case => self.parse_case(),
            TokenKind::Default => self.parse_default(),
            TokenKind::Break => {
                self.bump()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Break)
            }
            TokenKind::Continue => {
                self.bump()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Continue)
            }
            TokenKind::Return => {
                self.bump()?;
                if self.eat(TokenKind::Semicolon)? {
                    Ok(Stmt::Return(None))
                } else {
                    let e = self.parse_assignment()?;
                    self.expect(TokenKind::Semicolon, "';'")?;
                    Ok(Stmt::Return(Some(e)))
                }
            }
            TokenKind::Semicolon => {
                self.bump()?;
                Ok(Stmt::Block(Vec::new()))
            }
            _ => {
                let e = self.parse_assignment()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Expr(e))
            }
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, CompileError> {
        self.bump()?; // 'if'
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.parse_assignment()?;
        self.expect(TokenKind::RParen, "')'")?;
        let then = Box::new(self.parse_statement()?);
        let els = if self.eat(TokenKind::Else)? {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then, els })
    }

    fn parse_while(&mut self) -> Result<Stmt, CompileError> {
        self.bump()?; // 'while'
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.parse_assignment()?;
        self.expect(TokenKind::RParen, "')'")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While { cond, body })
    }

    fn parse_for(&mut self) -> Result<Stmt, CompileError> {
        self.bump()?; // 'for'
        self.expect(TokenKind::LParen, "'('")?;
        self.scopes.push(HashMap::new());
        let init = if self.eat(TokenKind::Semicolon)? {
            None
        } else if self.is_type_start()? {
            let decls = self.parse_local_declaration()?;
            Some(Box::new(Stmt::Block(decls)))
        } else {
            let e = self.parse_assignment()?;
            self.expect(TokenKind::Semicolon, "';'")?;
            Some(Box::new(Stmt::Expr(e)))
        };
        let cond = if self.at(TokenKind::Semicolon)? {
            None
        } else {
            Some(self.parse_assignment()?)
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        let step = if self.at(TokenKind::RParen)? {
            None
        } else {
            Some(self.parse_assignment()?)
        };
        self.expect(TokenKind::RParen, "')'")?;
        let body = Box::new(self.parse_statement()?);
        self.scopes.pop();
        Ok(Stmt::For { init, cond, step, body })
    }

    fn parse_switch(&mut self) -> Result<Stmt, CompileError> {
        self.bump()?; // 'switch'
        self.expect(TokenKind::LParen, "'('")?;
        let scrutinee = self.parse_assignment()?;
        self.expect(TokenKind::RParen, "')'")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::Switch { scrutinee, body })
    }

    fn parse_case(&mut self) -> Result<Stmt, CompileError> {
        self.bump()?; // 'case'
        let e = self.parse_assignment()?;
        let value = self.const_eval(&e)?;
        self.expect(TokenKind::Colon, "':'")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::Case { value, body })
    }

    fn parse_default(&mut self) -> Result<Stmt, CompileError> {
        self.bump()?; // 'default'
        self.expect(TokenKind::Colon, "':'")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::Default { body })
    }

    // ---- expressions: precedence climbing -------------------------------
    //
    // assignment (right-assoc) > ternary > logical-or > logical-and >
    // bit-or > bit-xor > bit-and > equality > relational > shift >
    // additive > multiplicative > unary/cast > postfix > primary
    //.

    /// A declarator initializer: either a brace-enclosed list for an array
    /// or struct/union, or an ordinary assignment-expression.
    fn parse_initializer(&mut self, target_ty: TypeId) -> Result<Expr, CompileError> {
        if self.at(TokenKind::LBrace)? {
            self.parse_brace_initializer(target_ty)
        } else {
            self.parse_assignment()
        }
    }

    /// `{e1, e2, ...}`. Elements are matched positionally against array
    /// elements or struct/union members; a trailing comma before `}` is
    /// accepted. Uninitialized tail elements are left out of `elements`
    /// entirely and are zero-filled by codegen.
    fn parse_brace_initializer(&mut self, target_ty: TypeId) -> Result<Expr, CompileError> {
        let loc = SourceLocation { line: self.peek()?.line };
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut elements = Vec::new();
        let mut index = 0usize;
        while !self.at(TokenKind::RBrace)? {
            let element_ty = self.initializer_element_type(target_ty, index);
            elements.push(self.parse_initializer(element_ty)?);
            index += 1;
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Expr::InitList { elements, ty: target_ty, loc })
    }

    /// The type a nested initializer at `index` should be parsed against:
    /// an array's element type, a struct/union's `index`-th member, or
    /// (for any other target, or an index past the last member) the
    /// target type itself as a scalar fallback.
    fn initializer_element_type(&self, target_ty: TypeId, index: usize) -> TypeId {
        match &self.types.get(target_ty).kind {
            TypeKind::Array(elem, _) => *elem,
            TypeKind::Struct(agg) | TypeKind::Union(agg) => {
                agg.members.get(index).map(|m| m.ty).unwrap_or(target_ty)
            }
            _ => target_ty,
        }
    }

    fn parse_assignment(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_ternary()?;
        let tok = self.peek()?;
        let loc = SourceLocation { line: tok.line };
        let compound_op = match tok.kind {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinOp::Add),
            TokenKind::MinusAssign => Some(BinOp::Sub),
            TokenKind::StarAssign => Some(BinOp::Mul),
            TokenKind::SlashAssign => Some(BinOp::Div),
            TokenKind::PercentAssign => Some(BinOp::Mod),
            TokenKind::AmpAssign => Some(BinOp::BitAnd),
            TokenKind::PipeAssign => Some(BinOp::BitOr),
            TokenKind::CaretAssign => Some(BinOp::BitXor),
            TokenKind::ShlAssign => Some(BinOp::Shl),
            TokenKind::ShrAssign => Some(BinOp::Shr),
            _ => return Ok(lhs),
        };
        let is_plain_assign = matches!(tok.kind, TokenKind::Assign);
        self.bump()?;
        let rhs = self.parse_assignment()?;
        let ty = lhs.ty();
        if is_plain_assign {
            Ok(Expr::Assign { lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc })
        } else {
            Ok(Expr::CompoundAssign { op: compound_op.unwrap(), lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc })
        }
    }

    fn parse_ternary(&mut self) -> Result<Expr, CompileError> {
        let cond = self.parse_logical_or()?;
        if self.eat(TokenKind::Question)? {
            let loc = cond.loc();
            let then = self.parse_assignment()?;
            self.expect(TokenKind::Colon, "':'")?;
            let els = self.parse_assignment()?;
            let ty = then.ty();
            Ok(Expr::Ternary { cond: Box::new(cond), then: Box::new(then), els: Box::new(els), ty, loc })
        } else {
            Ok(cond)
        }
    }

    fn parse_logical_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_logical_and()?;
        while self.at(TokenKind::PipePipe)? {
            let loc = SourceLocation { line: self.peek()?.line };
            self.bump()?;
            let rhs = self.parse_logical_and()?;
            let ty = self.types.int();
            lhs = Expr::Binary { op: BinOp::LogOr, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_logical_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_bit_or()?;
        while self.at(TokenKind::AmpAmp)? {
            let loc = SourceLocation { line: self.peek()?.line };
            self.bump()?;
            let rhs = self.parse_bit_or()?;
            let ty = self.types.int();
            lhs = Expr::Binary { op: BinOp::LogAnd, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_bit_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_bit_xor()?;
        while self.at(TokenKind::Pipe)? {
            let loc = SourceLocation { line: self.peek()?.line };
            self.bump()?;
            let rhs = self.parse_bit_xor()?;
            let ty = lhs.ty();
            lhs = Expr::Binary { op: BinOp::BitOr, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_bit_and()?;
        while self.at(TokenKind::Caret)? {
            let loc = SourceLocation { line: self.peek()?.line };
            self.bump()?;
            let rhs = self.parse_bit_and()?;
            let ty = lhs.ty();
            lhs = Expr::Binary { op: BinOp::BitXor, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_equality()?;
        while self.at(TokenKind::Amp)? {
            let loc = SourceLocation { line: self.peek()?.line };
            self.bump()?;
            let rhs = self.parse_equality()?;
            let ty = lhs.ty();
            lhs = Expr::Binary { op: BinOp::BitAnd, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let tok = self.peek()?;
            let op = match tok.kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::Ne => BinOp::Ne,
                _ => break,
            };
            let loc = SourceLocation { line: tok.line };
            self.bump()?;
            let rhs = self.parse_relational()?;
            let ty = self.types.int();
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_shift()?;
        loop {
            let tok = self.peek()?;
            let op = match tok.kind {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Ge => BinOp::Ge,
                _ => break,
            };
            let loc = SourceLocation { line: tok.line };
            self.bump()?;
            let rhs = self.parse_shift()?;
            let ty = self.types.int();
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let tok = self.peek()?;
            let op = match tok.kind {
                TokenKind::Shl => BinOp::Shl,
                TokenKind::Shr => BinOp::Shr,
                _ => break,
            };
            let loc = SourceLocation { line: tok.line };
            self.bump()?;
            let rhs = self.parse_additive()?;
            let ty = lhs.ty();
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let tok = self.peek()?;
            let op = match tok.kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let loc = SourceLocation { line: tok.line };
            self.bump()?;
            let rhs = self.parse_multiplicative()?;
            // Pointer arithmetic keeps the pointer's type; codegen scales
            // by the pointee size.
            let ty = if self.types.is_pointer(lhs.ty()) { lhs.ty() } else { rhs_or_lhs_ty(&lhs, &rhs) };
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let tok = self.peek()?;
            let op = match tok.kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            let loc = SourceLocation { line: tok.line };
            self.bump()?;
            let rhs = self.parse_unary()?;
            let ty = lhs.ty();
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), ty, loc };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let tok = self.peek()?;
        let loc = SourceLocation { line: tok.line };
        match tok.kind {
            TokenKind::Plus => {
                self.bump()?;
                self.parse_unary()
            }
            TokenKind::Minus => {
                self.bump()?;
                let e = self.parse_unary()?;
                let ty = e.ty();
                Ok(Expr::Unary { op: UnaryOp::Neg, expr: Box::new(e), ty, loc })
            }
            TokenKind::Bang => {
                self.bump()?;
                let e = self.parse_unary()?;
                let ty = self.types.int();
                Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(e), ty, loc })
            }
            TokenKind::Tilde => {
                self.bump()?;
                let e = self.parse_unary()?;
                let ty = e.ty();
                Ok(Expr::Unary { op: UnaryOp::BitNot, expr: Box::new(e), ty, loc })
            }
            TokenKind::Star => {
                self.bump()?;
                let e = self.parse_unary()?;
                let ty = self.types.pointee(e.ty()).unwrap_or_else(|| self.types.int());
                Ok(Expr::Deref { expr: Box::new(e), ty, loc })
            }
            TokenKind::Amp => {
                self.bump()?;
                let e = self.parse_unary()?;
                let pointee = e.ty();
                let ty = self.types.pointer(pointee);
                Ok(Expr::AddrOf { expr: Box::new(e), ty, loc })
            }
            TokenKind::PlusPlus => {
                self.bump()?;
                let e = self.parse_unary()?;
                let ty = e.ty();
                Ok(Expr::PreInc { expr: Box::new(e), ty, loc })
            }
            TokenKind::MinusMinus => {
                self.bump()?;
                let e = self.parse_unary()?;
                let ty = e.ty();
                Ok(Expr::PreDec { expr: Box::new(e), ty, loc })
            }
            TokenKind::Sizeof => {
                self.bump()?;
                let int_ty = self.types.int();
                if self.at(TokenKind::LParen)? && self.peek_is_type_after_paren()? {
                    self.bump()?; // '('
                    let ty = self.parse_type_name()?;
                    self.expect(TokenKind::RParen, "')'")?;
                    let size = self.types.size_of(ty) as i64;
                    Ok(Expr::Integer { value: size, ty: int_ty, loc })
                } else {
                    let e = self.parse_unary()?;
                    let size = self.types.size_of(e.ty()) as i64;
                    Ok(Expr::Integer { value: size, ty: int_ty, loc })
                }
            }
            TokenKind::LParen if self.peek_is_type_after_paren()? => {
                self.bump()?; // '('
                let ty = self.parse_type_name()?;
                self.expect(TokenKind::RParen, "')'")?;
                let e = self.parse_unary()?;
                Ok(Expr::Cast { expr: Box::new(e), ty, loc })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut e = self.parse_primary()?;
        loop {
            let tok = self.peek()?;
            let loc = SourceLocation { line: tok.line };
            match tok.kind {
                TokenKind::LBracket => {
                    self.bump()?;
                    let index = self.parse_assignment()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    let ty = self.types.pointee(e.ty()).unwrap_or_else(|| self.types.int());
                    e = Expr::Index { base: Box::new(e), index: Box::new(index), ty, loc };
                }
                TokenKind::LParen => {
                    let name = match &e {
                        Expr::Identifier { name, .. } => name.clone(),
                        _ => return Err(self.err(loc.line, "only direct function calls are supported")),
                    };
                    self.bump()?;
                    let mut args = Vec::new();
                    if !self.at(TokenKind::RParen)? {
                        loop {
                            args.push(self.parse_assignment()?);
                            if !self.eat(TokenKind::Comma)? {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    let ty = self
                        .functions
                        .get(&name)
                        .and_then(|&fid| match &self.types.get(fid).kind {
                            TypeKind::Function { ret, .. } => Some(*ret),
                            _ => None,
                        })
                        .ok_or_else(|| self.err(loc.line, format!("call to undeclared function '{}'", name)))?;
                    e = Expr::Call { callee: name, args, ty, loc };
                }
                TokenKind::Dot => {
                    self.bump()?;
                    let (name, _l) = self.expect_ident()?;
                    let ty = self.types.member(e.ty(), &name).map(|m| m.ty).unwrap_or_else(|| self.types.int());
                    e = Expr::Member { base: Box::new(e), name, is_arrow: false, ty, loc };
                }
                TokenKind::Arrow => {
                    self.bump()?;
                    let (name, _l) = self.expect_ident()?;
                    let base_ty = self.types.pointee(e.ty()).unwrap_or_else(|| e.ty());
                    let ty = self.types.member(base_ty, &name).map(|m| m.ty).unwrap_or_else(|| self.types.int());
                    e = Expr::Member { base: Box::new(e), name, is_arrow: true, ty, loc };
                }
                TokenKind::PlusPlus => {
                    self.bump()?;
                    let ty = e.ty();
                    e = Expr::PostInc { expr: Box::new(e), ty, loc };
                }
                TokenKind::MinusMinus => {
                    self.bump()?;
                    let ty = e.ty();
                    e = Expr::PostDec { expr: Box::new(e), ty, loc };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let tok = self.bump()?;
        let loc = SourceLocation { line: tok.line };
        match tok.kind {
            TokenKind::Int(value, _suffix) => {
                let ty = self.types.int();
                Ok(Expr::Integer { value, ty, loc })
            }
            TokenKind::Float(value) => {
                let ty = self.types.double();
                Ok(Expr::Float { value, ty, loc })
            }
            TokenKind::Char(value) => {
                let ty = self.types.char_ty();
                Ok(Expr::Integer { value, ty, loc })
            }
            TokenKind::Str(value) => {
                let char_ty = self.types.char_ty();
                let ty = self.types.pointer(char_ty);
                Ok(Expr::Str { value, ty, loc })
            }
            TokenKind::Identifier(name) => {
                if let Some(&value) = self.enum_constants.get(&name) {
                    let ty = self.types.int();
                    return Ok(Expr::Integer { value, ty, loc });
                }
                let ty = self
                    .lookup_variable(&name)
                    .ok_or_else(|| self.err(loc.line, format!("use of undeclared identifier '{}'", name)))?;
                Ok(Expr::Identifier { name, ty, loc })
            }
            TokenKind::LParen => {
                let e = self.parse_assignment()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(e)
            }
            other => Err(self.err(loc.line, format!("expected an expression, got {:?}", other))),
        }
    }
}

/// Usual-arithmetic-conversion stand-in: widen to whichever side already
/// has the larger rank, falling back to the left operand.
fn rhs_or_lhs_ty(lhs: &Expr, rhs: &Expr) -> TypeId {
    let _ = rhs;
    lhs.ty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixc_core::Target;

    fn parse_ok(src: &str) -> Program {
        let mut p = Parser::new("t.c", src, Target::linux64());
        p.parse().unwrap()
    }

    #[test]
    fn parses_empty_main() {
        let program = parse_ok("int main(void) { return 0; }");
        assert_eq!(program.functions.len(), 1);
        assert_eq!(program.functions[0].name, "main");
    }

    #[test]
    fn parses_global_and_function_with_params() {
        let program = parse_ok("int counter; int add(int a, int b) { return a + b; }");
        assert_eq!(program.globals.len(), 1);
        assert_eq!(program.globals[0].name, "counter");
        let add = program.find_function("add").unwrap();
        assert_eq!(add.params.len(), 2);
    }

    #[test]
    fn parses_struct_and_member_access() {
        let program = parse_ok(
            "struct Point { int x; int y; }; int get_x(struct Point p) { return p.x; }",
        );
        let get_x = program.find_function("get_x").unwrap();
        assert!(get_x.body.is_some());
    }

    #[test]
    fn parses_if_while_for_loops() {
        let program = parse_ok(
            "int f(int n) { int sum = 0; for (int i = 0; i < n; i = i + 1) { sum = sum + i; } if (sum > 10) { return 1; } else { return 0; } }",
        );
        assert!(program.find_function("f").is_some());
    }

    #[test]
    fn parses_pointer_declarator_and_deref() {
        let program = parse_ok("int deref(int *p) { return *p; }");
        let f = program.find_function("deref").unwrap();
        assert_eq!(f.params.len(), 1);
    }

    #[test]
    fn parses_typedef_and_uses_it() {
        let program = parse_ok("typedef int length_t; length_t measure() { return 5; }");
        assert!(program.find_function("measure").is_some());
    }

    #[test]
    fn parses_array_declarator_with_constant_length() {
        let program = parse_ok("int table[2 + 3]; int use_table() { return table[0]; }");
        assert_eq!(program.globals[0].name, "table");
    }

    #[test]
    fn parses_cast_distinct_from_parenthesized_expression() {
        let program = parse_ok("int f(int x) { int y = (int)x; int z = (x + 1) * 2; return y + z; }");
        assert!(program.find_function("f").is_some());
    }

    #[test]
    fn sizeof_folds_to_an_integer_constant() {
        let program = parse_ok("int f() { int n = sizeof(int); return n; }");
        let f = program.find_function("f").unwrap();
        match f.body.as_ref().unwrap() {
            Stmt::Block(stmts) => match &stmts[0] {
                Stmt::VarDecl(d) => match d.init.as_ref().unwrap() {
                    Expr::Integer { value, .. } => assert_eq!(*value, 4),
                    other => panic!("expected folded sizeof, got {:?}", other),
                },
                other => panic!("expected var decl, got {:?}", other),
            },
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn switch_case_default_parse_as_flat_label_sequence() {
        let program = parse_ok(
            "int f(int n) { switch (n) { case 1: return 1; case 2: return 2; default: return 0; } return 0; }",
        );
        assert!(program.find_function("f").is_some());
    }

    #[test]
    fn brace_initializer_parses_into_init_list() {
        let program = parse_ok("int f() { int a[5] = {1, 2, 3, 4, 5}; return a[0]; }");
        let f = program.find_function("f").unwrap();
        match f.body.as_ref().unwrap() {
            Stmt::Block(stmts) => match &stmts[0] {
                Stmt::VarDecl(d) => match d.init.as_ref().unwrap() {
                    Expr::InitList { elements, .. } => assert_eq!(elements.len(), 5),
                    other => panic!("expected InitList, got {:?}", other),
                },
                other => panic!("expected var decl, got {:?}", other),
            },
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn brace_initializer_matches_struct_members_positionally() {
        let program = parse_ok(
            "struct P { int x; int y; }; int f() { struct P p = {7, 35}; return p.x; }",
        );
        let f = program.find_function("f").unwrap();
        match f.body.as_ref().unwrap() {
            Stmt::Block(stmts) => match &stmts[0] {
                Stmt::VarDecl(d) => match d.init.as_ref().unwrap() {
                    Expr::InitList { elements, .. } => assert_eq!(elements.len(), 2),
                    other => panic!("expected InitList, got {:?}", other),
                },
                other => panic!("expected var decl, got {:?}", other),
            },
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn pragma_pack_marker_is_consumed_and_applied() {
        let mut p = Parser::new(
            "t.c",
            "_Pragma(\"pack(1)\"); struct P { char a; int b; };",
            Target::linux64(),
        );
        let program = p.parse().unwrap();
        assert!(program.functions.is_empty());
        let s = p.struct_tags.get("P").copied().unwrap();
        let b = p.types.member(s, "b").unwrap();
        assert_eq!(b.offset, 1);
    }

    #[test]
    fn undeclared_identifier_is_a_parse_error() {
        let mut p = Parser::new("t.c", "int f() { return y; }", Target::linux64());
        assert!(p.parse().is_err());
    }

    #[test]
    fn missing_semicolon_reports_line_number() {
        let mut p = Parser::new("t.c", "int f() { return 0 }", Target::linux64());
        let err = p.parse().unwrap_err();
        assert!(err.to_string().contains("t.c:1"));
    }
}
