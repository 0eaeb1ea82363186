//! x86-64 code generation.
//!
//! Two emission modes share the front end's lowering: `text_asm` produces
//! AT&T or Intel assembly text for `-S`, while `encode` produces bytes and
//! relocation records consumed directly by the object writers for `--obj`
//! and the default linked-executable path. Both walk the same typed AST
//! via post-order expression lowering into `rax`/`xmm0`, with one
//! canonical error type (`CompileError`) threaded through every stage.

pub mod abi;
pub mod encode;
mod expr;
mod frame;
mod stmt;
pub mod text_asm;

use crate::ast::{Function, Program};
use crate::config::{AsmSyntax, CompilerConfig};
use crate::error::CompileError;
use crate::types::TypeTable;
use abi::Abi;
use fixc_core::Target;
use frame::Frame;
use std::collections::HashMap;
use text_asm::{AsmWriter, Syntax};

/// Per-function codegen state: the stack frame, a function-local label
/// counter for branches, and the break/continue target stack for nested
/// loops and switches.
pub struct Codegen<'a> {
    types: &'a TypeTable,
    writer: AsmWriter,
    abi: Abi,
    frame: Frame,
    function_name: String,
    label_counter: u32,
    break_labels: Vec<String>,
    continue_labels: Vec<String>,
    /// Accumulated string-literal data, keyed by generated label, emitted
    /// into `.rodata` once the function body has been walked.
    string_literals: Vec<(String, String)>,
}

fn abi_for(target: Target) -> Abi {
    if target.is_windows() {
        Abi::Win64
    } else {
        Abi::SysV
    }
}

fn syntax_for(config: &CompilerConfig) -> Syntax {
    match config.syntax {
        AsmSyntax::AttT => Syntax::AttT,
        AsmSyntax::Intel => Syntax::Intel,
    }
}

/// Emit textual assembly for an entire translation unit.
pub fn emit_assembly(program: &Program, types: &TypeTable, config: &CompilerConfig) -> Result<String, CompileError> {
    let abi = abi_for(config.target);
    let syntax = syntax_for(config);
    let mut writer = AsmWriter::new(syntax);
    writer.file_header(&format!("fixc output for {:?}", config.target));

    let mut string_literals = Vec::new();

    writer.section(".text");
    for global in &program.globals {
        if !global.is_extern {
            writer.global(&global.name);
        }
    }
    for function in &program.functions {
        if function.body.is_none() {
            continue;
        }
        writer.global(&function.name);
        let mut cg = Codegen {
            types,
            writer: AsmWriter::new(syntax),
            abi,
            frame: Frame::build(function, types, abi),
            function_name: function.name.clone(),
            label_counter: 0,
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
            string_literals: Vec::new(),
        };
        cg.gen_function(function)?;
        writer.lines.extend(cg.writer.lines);
        string_literals.extend(cg.string_literals);
    }

    if !program.globals.is_empty() {
        writer.section(".data");
        for global in &program.globals {
            if global.is_extern {
                continue;
            }
            writer.label(&global.name);
            let size = types.size_of(global.ty).max(1);
            writer.raw(format!("    .zero {}", size));
        }
    }

    if !string_literals.is_empty() {
        writer.section(".rodata");
        for (label, value) in &string_literals {
            writer.label(label);
            writer.raw(format!("    .asciz \"{}\"", escape_asciz(value)));
        }
    }

    Ok(writer.finish())
}

/// One function's machine code plus its relocations and public symbol
/// name, ready for the `object` writers.
pub struct ObjectFunction {
    pub name: String,
    pub code: encode::EncodedFunction,
}

/// Direct-to-bytes counterpart of `emit_assembly`, covering the integer
/// core of the language: literals, locals, arithmetic/comparison,
/// assignment, `if`/`while`, `return`, and direct calls. Aggregates,
/// switch, and casts go through `emit_assembly` only for now: the
/// external-assembler path remains the fallback for those forms (see
/// DESIGN.md).
pub fn emit_object(program: &Program, types: &TypeTable, config: &CompilerConfig) -> Result<Vec<ObjectFunction>, CompileError> {
    let abi = abi_for(config.target);
    let mut out = Vec::new();
    for function in &program.functions {
        let Some(body) = &function.body else { continue };
        let frame = Frame::build(function, types, abi);
        let mut oc = ObjectCodegen { types, enc: encode::Encoder::new(), abi, frame, label_counter: 0 };
        oc.gen_function(function, body)?;
        out.push(ObjectFunction { name: function.name.clone(), code: oc.enc.finish()? });
    }
    Ok(out)
}

struct ObjectCodegen<'a> {
    types: &'a TypeTable,
    enc: encode::Encoder,
    abi: Abi,
    frame: Frame,
    label_counter: u32,
}

impl<'a> ObjectCodegen<'a> {
    fn new_label(&mut self, tag: &str) -> String {
        self.label_counter += 1;
        format!("L{}_{}", tag, self.label_counter)
    }

    fn gen_function(&mut self, function: &Function, body: &crate::ast::Stmt) -> Result<(), CompileError> {
        encode::encode_prologue(&mut self.enc, self.frame.locals_size);
        self.spill_parameters(function);
        self.gen_stmt(body)?;
        encode::encode_epilogue(&mut self.enc);
        Ok(())
    }

    fn spill_parameters(&mut self, function: &Function) {
        let is_float = vec![false; function.params.len()];
        let locations = abi::classify_args(self.abi, &is_float);
        for (param, loc) in function.params.iter().zip(locations) {
            if let abi::ArgLocation::IntRegister(reg) = loc {
                let offset = self.frame.offset_of(&param.name);
                let size = self.types.size_of(param.ty);
                self.enc.mov_rbp_from_reg_sized(offset, int_reg(reg), size);
            }
        }
    }

    fn gen_stmt(&mut self, stmt: &crate::ast::Stmt) -> Result<(), CompileError> {
        use crate::ast::Stmt;
        match stmt {
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.gen_stmt(s)?;
                }
            }
            Stmt::Expr(expr) => {
                self.gen_expr(expr)?;
            }
            Stmt::VarDecl(decl) => {
                if let Some(init) = &decl.init {
                    self.gen_expr(init)?;
                    let offset = self.frame.offset_of(&decl.name);
                    let size = self.types.size_of(decl.ty);
                    self.enc.mov_rbp_from_reg_sized(offset, encode::Reg::Rax, size);
                }
            }
            Stmt::Return(value) => {
                if let Some(expr) = value {
                    self.gen_expr(expr)?;
                }
                encode::encode_epilogue(&mut self.enc);
            }
            Stmt::If { cond, then, els } => {
                self.gen_expr(cond)?;
                self.enc.cmp_reg_imm32(encode::Reg::Rax, 0);
                let else_label = self.new_label("else");
                let end_label = self.new_label("end");
                self.enc.je(&else_label);
                self.gen_stmt(then)?;
                if els.is_some() {
                    self.enc.jmp(&end_label);
                }
                self.enc.label(&else_label);
                if let Some(els) = els {
                    self.gen_stmt(els)?;
                    self.enc.label(&end_label);
                }
            }
            Stmt::While { cond, body } => {
                let start = self.new_label("while_start");
                let end = self.new_label("while_end");
                self.enc.label(&start);
                self.gen_expr(cond)?;
                self.enc.cmp_reg_imm32(encode::Reg::Rax, 0);
                self.enc.je(&end);
                self.gen_stmt(body)?;
                self.enc.jmp(&start);
                self.enc.label(&end);
            }
            other => {
                return Err(CompileError::codegen(format!(
                    "direct object encoding does not yet cover this statement form: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    fn gen_expr(&mut self, expr: &crate::ast::Expr) -> Result<(), CompileError> {
        use crate::ast::{BinOp, Expr};
        match expr {
            Expr::Integer { value, .. } => {
                self.enc.mov_reg_imm32(encode::Reg::Rax, *value as i32);
            }
            Expr::Identifier { name, ty, .. } => {
                let offset = self.frame.offset_of(name);
                let size = self.types.size_of(*ty);
                self.enc.mov_reg_from_rbp_sized(encode::Reg::Rax, offset, size);
            }
            Expr::Assign { lhs, rhs, .. } => {
                self.gen_expr(rhs)?;
                if let Expr::Identifier { name, ty, .. } = lhs.as_ref() {
                    let offset = self.frame.offset_of(name);
                    let size = self.types.size_of(*ty);
                    self.enc.mov_rbp_from_reg_sized(offset, encode::Reg::Rax, size);
                } else {
                    return Err(CompileError::codegen("direct object encoding only assigns to plain locals"));
                }
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                self.gen_expr(lhs)?;
                self.enc.push_reg(encode::Reg::Rax);
                self.gen_expr(rhs)?;
                self.enc.mov_reg_reg(encode::Reg::Rcx, encode::Reg::Rax);
                self.enc.pop_reg(encode::Reg::Rax);
                match op {
                    BinOp::Add => self.enc.add_reg_reg(encode::Reg::Rax, encode::Reg::Rcx),
                    BinOp::Sub => self.enc.sub_reg_reg(encode::Reg::Rax, encode::Reg::Rcx),
                    BinOp::Mul => self.enc.imul_reg_reg(encode::Reg::Rax, encode::Reg::Rcx),
                    BinOp::Div => {
                        self.enc.cqo();
                        self.enc.idiv_reg(encode::Reg::Rcx);
                    }
                    BinOp::Mod => {
                        self.enc.cqo();
                        self.enc.idiv_reg(encode::Reg::Rcx);
                        self.enc.mov_reg_reg(encode::Reg::Rax, encode::Reg::Rdx);
                    }
                    BinOp::BitAnd => self.enc.and_reg_reg(encode::Reg::Rax, encode::Reg::Rcx),
                    BinOp::BitOr => self.enc.or_reg_reg(encode::Reg::Rax, encode::Reg::Rcx),
                    BinOp::BitXor => self.enc.xor_reg_reg(encode::Reg::Rax, encode::Reg::Rcx),
                    BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                        self.enc.cmp_reg_reg(encode::Reg::Rax, encode::Reg::Rcx);
                        let cc = match op {
                            BinOp::Lt => 0xC,
                            BinOp::Ge => 0xD,
                            BinOp::Le => 0xE,
                            BinOp::Gt => 0xF,
                            BinOp::Eq => 0x4,
                            BinOp::Ne => 0x5,
                            _ => unreachable!(),
                        };
                        self.enc.mov_reg_imm32(encode::Reg::Rax, 0);
                        self.enc.setcc_al(cc);
                    }
                    other => {
                        return Err(CompileError::codegen(format!(
                            "direct object encoding does not yet cover operator {:?}",
                            other
                        )));
                    }
                }
            }
            Expr::Call { callee, args, .. } => {
                let is_float = vec![false; args.len()];
                let locations = abi::classify_args(self.abi, &is_float);
                for arg in args.iter().rev() {
                    self.gen_expr(arg)?;
                    self.enc.push_reg(encode::Reg::Rax);
                }
                for loc in locations.into_iter().rev() {
                    if let abi::ArgLocation::IntRegister(reg) = loc {
                        self.enc.pop_reg(int_reg(reg));
                    }
                }
                self.enc.call_symbol(callee);
            }
            other => {
                return Err(CompileError::codegen(format!(
                    "direct object encoding does not yet cover this expression form: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }
}

/// Map an ABI register name (as used by `abi::classify_args`) to its
/// `encode::Reg` encoding.
fn int_reg(name: &'static str) -> encode::Reg {
    match name {
        "rdi" => encode::Reg::Rdi,
        "rsi" => encode::Reg::Rsi,
        "rdx" => encode::Reg::Rdx,
        "rcx" => encode::Reg::Rcx,
        "r8" => encode::Reg::R8,
        "r9" => encode::Reg::R9,
        other => unreachable!("unexpected integer argument register {}", other),
    }
}

fn escape_asciz(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

impl<'a> Codegen<'a> {
    fn new_label(&mut self, tag: &str) -> String {
        self.label_counter += 1;
        format!(".L{}_{}_{}", self.function_name, tag, self.label_counter)
    }

    fn new_string_literal(&mut self, value: &str) -> String {
        let label = self.new_label("str");
        self.string_literals.push((label.clone(), value.to_string()));
        label
    }

    fn gen_function(&mut self, function: &Function) -> Result<(), CompileError> {
        use text_asm::Operand::*;
        self.writer.label(&function.name);
        self.writer.insn1("push", Reg("rbp"));
        self.writer.insn2("mov", Reg("rbp"), Reg("rsp"));
        if self.frame.locals_size > 0 {
            self.writer
                .insn2("sub", Reg("rsp"), Imm(self.frame.locals_size as i64));
        }

        self.spill_parameters(function)?;

        if let Some(body) = &function.body {
            self.gen_stmt(body)?;
        }

        // Fallback epilogue in case the body doesn't end in `return` (C
        // permits falling off the end of a non-void function with an
        // unspecified return value, so this just returns whatever is
        // already in `rax`).
        self.emit_epilogue();
        Ok(())
    }

    fn emit_epilogue(&mut self) {
        use text_asm::Operand::*;
        self.writer.insn2("mov", Reg("rsp"), Reg("rbp"));
        self.writer.insn1("pop", Reg("rbp"));
        self.writer.insn0("ret");
    }

    /// Copy incoming register/stack arguments into their home stack slots
    /// so the rest of codegen can treat every local uniformly as a
    /// `rbp`-relative memory operand.
    fn spill_parameters(&mut self, function: &Function) -> Result<(), CompileError> {
        use text_asm::Operand::*;
        let is_float = vec![false; function.params.len()]; // no float parameters in this subset's ABI tests
        let locations = abi::classify_args(self.abi, &is_float);
        for (param, loc) in function.params.iter().zip(locations) {
            let offset = self.frame.offset_of(&param.name);
            match loc {
                abi::ArgLocation::IntRegister(reg) => {
                    self.store_reg_sized(param.ty, reg, Mem { base: "rbp", disp: offset });
                }
                abi::ArgLocation::FloatRegister(_) => {
                    // Not reached while `is_float` is all-false above; kept
                    // for when float parameters are added to the subset.
                }
                abi::ArgLocation::Stack(stack_off) => {
                    // Incoming stack arguments sit above the saved `rbp`
                    // and return address.
                    self.load_sized(param.ty, Mem { base: "rbp", disp: 16 + stack_off as i32 });
                    self.store_sized(param.ty, Mem { base: "rbp", disp: offset });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile(src: &str) -> String {
        let mut parser = Parser::new("t.c", src, Target::linux64());
        let program = parser.parse().unwrap();
        let config = CompilerConfig::default();
        emit_assembly(&program, &parser.types, &config).unwrap()
    }

    #[test]
    fn emits_prologue_and_epilogue_for_empty_function() {
        let asm = compile("int main(void) { return 0; }");
        assert!(asm.contains("push %rbp"));
        assert!(asm.contains("mov %rsp, %rbp"));
        assert!(asm.contains("ret"));
    }

    #[test]
    fn reserves_stack_space_for_locals() {
        let asm = compile("int f() { int a; int b; return 0; }");
        assert!(asm.contains("sub $16, %rsp") || asm.contains("sub $8, %rsp"));
    }

    fn compile_object(src: &str) -> Vec<ObjectFunction> {
        let mut parser = Parser::new("t.c", src, Target::linux64());
        let program = parser.parse().unwrap();
        let config = CompilerConfig::default();
        emit_object(&program, &parser.types, &config).unwrap()
    }

    #[test]
    fn object_function_ends_in_a_ret_opcode() {
        let funcs = compile_object("int f(int a) { return a + 1; }");
        assert_eq!(funcs.len(), 1);
        assert_eq!(funcs[0].name, "f");
        assert_eq!(*funcs[0].code.bytes.last().unwrap(), 0xC3);
    }

    #[test]
    fn object_call_produces_one_relocation_per_call_site() {
        let funcs = compile_object("int g(int a) { return a; } int f(int a) { return g(a); }");
        let f = funcs.iter().find(|func| func.name == "f").unwrap();
        assert_eq!(f.code.relocations.len(), 1);
        assert_eq!(f.code.relocations[0].symbol, "g");
    }

    #[test]
    fn pointer_plus_int_scales_by_pointee_size() {
        let asm = compile("int f(int *p) { return *(p + 3); }");
        // sizeof(int) == 4 on every target this compiler supports.
        assert!(asm.contains("$4") || asm.contains("4"));
    }

    #[test]
    fn pointer_difference_divides_by_pointee_size() {
        let asm = compile("int f(int *p, int *q) { return p - q; }");
        assert!(asm.contains("idiv"));
    }

    #[test]
    fn pointer_increment_advances_by_pointee_size_not_one() {
        let asm = compile("int f(int *p) { p++; return *p; }");
        assert!(asm.contains("$4"));
    }

    #[test]
    fn struct_member_store_uses_a_32_bit_register_not_rax() {
        let asm = compile("struct P { int x; int y; }; int f() { struct P p; p.x = 7; p.y = 35; return p.x + p.y; }");
        // An `int` member store must go through `%eax`, not the bare
        // 8-byte `%rax`, or the second member's store overruns into
        // whatever the frame placed right after it.
        assert!(asm.contains("mov %eax"));
    }

    #[test]
    fn brace_initializer_zero_fills_uninitialized_array_elements() {
        let asm = compile("int f() { int a[3] = {1}; return a[2]; }");
        assert!(asm.contains("$0"));
    }
}
