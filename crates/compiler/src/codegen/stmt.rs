//! Statement lowering. `switch` is lowered as a linear
//! comparison cascade against each `case` value rather than a jump table,
//! keeping control flow simple over dense-range optimization.

use super::Codegen;
use crate::ast::{Expr, Stmt};
use crate::error::CompileError;
use crate::types::{TypeId, TypeKind};
use text_asm::Operand::*;

use super::text_asm;

impl<'a> Codegen<'a> {
    pub(super) fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
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
                    let offset = self.frame.offset_of(&decl.name);
                    if let Expr::InitList { elements, .. } = init {
                        self.gen_init_list(decl.ty, offset, elements)?;
                    } else {
                        self.gen_expr(init)?;
                        self.store_sized(decl.ty, Mem { base: "rbp", disp: offset });
                    }
                }
            }
            Stmt::Return(value) => {
                if let Some(expr) = value {
                    self.gen_expr(expr)?;
                }
                self.emit_epilogue();
            }
            Stmt::If { cond, then, els } => {
                self.gen_expr(cond)?;
                self.writer.insn2("cmp", Reg("rax"), Imm(0));
                let else_label = self.new_label("if_else");
                let end_label = self.new_label("if_end");
                self.writer.insn1("je", Label(else_label.clone()));
                self.gen_stmt(then)?;
                if els.is_some() {
                    self.writer.insn1("jmp", Label(end_label.clone()));
                }
                self.writer.label(&else_label);
                if let Some(els) = els {
                    self.gen_stmt(els)?;
                    self.writer.label(&end_label);
                }
            }
            Stmt::While { cond, body } => {
                let start_label = self.new_label("while_start");
                let end_label = self.new_label("while_end");
                self.break_labels.push(end_label.clone());
                self.continue_labels.push(start_label.clone());

                self.writer.label(&start_label);
                self.gen_expr(cond)?;
                self.writer.insn2("cmp", Reg("rax"), Imm(0));
                self.writer.insn1("je", Label(end_label.clone()));
                self.gen_stmt(body)?;
                self.writer.insn1("jmp", Label(start_label.clone()));
                self.writer.label(&end_label);

                self.break_labels.pop();
                self.continue_labels.pop();
            }
            Stmt::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.gen_stmt(init)?;
                }
                let start_label = self.new_label("for_start");
                let step_label = self.new_label("for_step");
                let end_label = self.new_label("for_end");
                self.break_labels.push(end_label.clone());
                self.continue_labels.push(step_label.clone());

                self.writer.label(&start_label);
                if let Some(cond) = cond {
                    self.gen_expr(cond)?;
                    self.writer.insn2("cmp", Reg("rax"), Imm(0));
                    self.writer.insn1("je", Label(end_label.clone()));
                }
                self.gen_stmt(body)?;
                self.writer.label(&step_label);
                if let Some(step) = step {
                    self.gen_expr(step)?;
                }
                self.writer.insn1("jmp", Label(start_label.clone()));
                self.writer.label(&end_label);

                self.break_labels.pop();
                self.continue_labels.pop();
            }
            Stmt::Switch { scrutinee, body } => {
                let end_label = self.new_label("switch_end");
                self.break_labels.push(end_label.clone());

                self.gen_expr(scrutinee)?;
                self.writer.insn2("mov", Reg("r11"), Reg("rax"));
                self.gen_stmt(body)?;
                self.writer.label(&end_label);

                self.break_labels.pop();
            }
            // `case`/`default` labels emit a comparison against the saved
            // scrutinee (`r11`) and fall through into the labeled statement
            // and everything lexically after it within the enclosing
            // `Block`, matching C's labeled-statement fallthrough.
            Stmt::Case { value, body } => {
                let skip_label = self.new_label("case_skip");
                self.writer.insn2("cmp", Reg("r11"), Imm(*value));
                self.writer.insn1("jne", Label(skip_label.clone()));
                self.gen_stmt(body)?;
                self.writer.label(&skip_label);
            }
            Stmt::Default { body } => {
                self.gen_stmt(body)?;
            }
            Stmt::Break => {
                let label = self
                    .break_labels
                    .last()
                    .cloned()
                    .ok_or_else(|| CompileError::codegen("break outside loop or switch"))?;
                self.writer.insn1("jmp", Label(label));
            }
            Stmt::Continue => {
                let label = self
                    .continue_labels
                    .last()
                    .cloned()
                    .ok_or_else(|| CompileError::codegen("continue outside loop"))?;
                self.writer.insn1("jmp", Label(label));
            }
        }
        Ok(())
    }

    /// Lower a brace initializer into stores at `base_offset`, laying
    /// array elements out at `index * elem_size` and struct/union members
    /// at their declared offsets. Trailing members/elements with no
    /// initializer in `elements` are zeroed, matching C's "rest are
    /// zero-initialized" rule.
    fn gen_init_list(&mut self, ty: TypeId, base_offset: i64, elements: &[Expr]) -> Result<(), CompileError> {
        match &self.types.get(ty).kind {
            TypeKind::Array(elem_ty, length) => {
                let elem_ty = *elem_ty;
                let length = *length as usize;
                let elem_size = self.types.size_of(elem_ty).max(1) as i64;
                for index in 0..length {
                    let offset = base_offset + index as i64 * elem_size;
                    match elements.get(index) {
                        Some(Expr::InitList { elements: nested, .. }) => {
                            self.gen_init_list(elem_ty, offset, nested)?;
                        }
                        Some(expr) => {
                            self.gen_expr(expr)?;
                            self.store_sized(elem_ty, Mem { base: "rbp", disp: offset });
                        }
                        None => self.zero_fill(elem_ty, offset),
                    }
                }
            }
            TypeKind::Struct(agg) | TypeKind::Union(agg) => {
                let members = agg.members.clone();
                for (index, member) in members.iter().enumerate() {
                    let offset = base_offset + member.offset as i64;
                    match elements.get(index) {
                        Some(Expr::InitList { elements: nested, .. }) => {
                            self.gen_init_list(member.ty, offset, nested)?;
                        }
                        Some(expr) => {
                            self.gen_expr(expr)?;
                            self.store_sized(member.ty, Mem { base: "rbp", disp: offset });
                        }
                        None => self.zero_fill(member.ty, offset),
                    }
                }
            }
            _ => {
                // Scalar declared with a brace initializer, e.g. `int a = {5};`.
                if let Some(expr) = elements.first() {
                    self.gen_expr(expr)?;
                    self.store_sized(ty, Mem { base: "rbp", disp: base_offset });
                } else {
                    self.zero_fill(ty, base_offset);
                }
            }
        }
        Ok(())
    }

    fn zero_fill(&mut self, ty: TypeId, offset: i64) {
        self.writer.insn2("mov", Reg("rax"), Imm(0));
        self.store_sized(ty, Mem { base: "rbp", disp: offset });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{emit_assembly, text_asm::Syntax};
    use crate::config::CompilerConfig;
    use crate::parser::Parser;
    use fixc_core::Target;

    fn compile(src: &str) -> String {
        let mut parser = Parser::new("t.c", src, Target::linux64());
        let program = parser.parse().unwrap();
        let config = CompilerConfig::default();
        emit_assembly(&program, &parser.types, &config).unwrap()
    }

    #[test]
    fn if_else_emits_both_branch_labels() {
        let asm = compile("int f(int a) { if (a) { return 1; } else { return 2; } }");
        assert!(asm.contains("if_else"));
        assert!(asm.contains("if_end"));
    }

    #[test]
    fn while_loop_emits_start_and_end_labels() {
        let asm = compile("int f(int a) { while (a) { a = a - 1; } return a; }");
        assert!(asm.contains("while_start"));
        assert!(asm.contains("while_end"));
    }

    #[test]
    fn switch_case_compares_against_saved_scrutinee() {
        let asm = compile("int f(int a) { switch (a) { case 1: return 1; default: return 0; } }");
        assert!(asm.contains("cmp %r11"));
    }

    #[test]
    fn break_outside_loop_is_a_codegen_error() {
        // Constructed directly since the parser itself rejects this; this
        // exercises `gen_stmt`'s own defense independent of parse-time checks.
        use crate::ast::{SourceLocation, Stmt};
        let mut parser = Parser::new("t.c", "int f() { return 0; }", Target::linux64());
        let program = parser.parse().unwrap();
        let function = program.find_function("f").unwrap();
        let config = CompilerConfig::default();
        let abi = super::abi_for(config.target);
        let mut cg = Codegen {
            types: &parser.types,
            writer: text_asm::AsmWriter::new(Syntax::AttT),
            abi,
            frame: super::frame::Frame::build(function, &parser.types, abi),
            function_name: "f".into(),
            label_counter: 0,
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
            string_literals: Vec::new(),
        };
        let err = cg.gen_stmt(&Stmt::Break);
        assert!(err.is_err());
    }
}
