//! Expression lowering: post-order evaluation into `rax` (integers,
//! pointers) or `xmm0` (floats), spilling intermediate values to the stack
//! with `push`/`pop` rather than a fixed scratch-register set, the way
//! small recursive-descent-fed code generators typically do.

use super::Codegen;
use crate::ast::{BinOp, Expr, UnaryOp};
use crate::codegen::abi;
use crate::error::CompileError;
use crate::types::TypeId;
use text_asm::Operand::*;

use super::text_asm;

impl<'a> Codegen<'a> {
    /// Evaluate `expr`, leaving an integer/pointer result in `rax` (floats
    /// are out of scope for this pass and are loaded as their bit pattern
    /// into `rax` via `movq`-equivalent text, since the subset's codegen
    /// never needs to perform float arithmetic on them directly).
    pub(super) fn gen_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Integer { value, .. } => {
                self.writer.insn2("mov", Reg("rax"), Imm(*value));
            }
            Expr::Float { value, .. } => {
                // Bit-reinterpret the double into an integer load; a real
                // float pipeline would route this through `xmm0` with
                // `.rodata`-resident constants, left for a follow-on pass.
                self.writer.insn2("mov", Reg("rax"), Imm(value.to_bits() as i64));
            }
            Expr::Str { value, .. } => {
                let label = self.new_string_literal(value);
                self.writer.insn2("lea", Reg("rax"), RipRelative(label));
            }
            Expr::Identifier { name, ty, .. } => {
                self.load_identifier(name, *ty);
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                self.gen_binary(*op, lhs, rhs)?;
            }
            Expr::Assign { lhs, rhs, .. } => {
                self.gen_expr(rhs)?;
                self.store_to_lvalue(lhs)?;
            }
            Expr::CompoundAssign { op, lhs, rhs, .. } => {
                let scale = if matches!(op, BinOp::Add | BinOp::Sub) {
                    self.types.pointee(lhs.ty()).map(|pointee| self.types.size_of(pointee).max(1) as i64)
                } else {
                    None
                };
                self.gen_expr(lhs)?;
                self.writer.insn1("push", Reg("rax"));
                self.gen_expr(rhs)?;
                if let Some(elem_size) = scale {
                    self.writer.insn2("imul", Reg("rax"), Imm(elem_size));
                }
                self.writer.insn2("mov", Reg("rcx"), Reg("rax"));
                self.writer.insn1("pop", Reg("rax"));
                self.emit_binary_op(*op);
                self.store_to_lvalue(lhs)?;
            }
            Expr::Ternary { cond, then, els, .. } => {
                self.gen_expr(cond)?;
                self.writer.insn2("cmp", Reg("rax"), Imm(0));
                let else_label = self.new_label("ternary_else");
                let end_label = self.new_label("ternary_end");
                self.writer.insn1("je", Label(else_label.clone()));
                self.gen_expr(then)?;
                self.writer.insn1("jmp", Label(end_label.clone()));
                self.writer.label(&else_label);
                self.gen_expr(els)?;
                self.writer.label(&end_label);
            }
            Expr::Call { callee, args, .. } => {
                self.gen_call(callee, args)?;
            }
            Expr::Deref { expr, ty, .. } => {
                self.gen_expr(expr)?;
                self.load_sized(*ty, Mem { base: "rax", disp: 0 });
            }
            Expr::AddrOf { expr, .. } => {
                self.gen_addr(expr)?;
            }
            Expr::Unary { op, expr, .. } => {
                self.gen_expr(expr)?;
                match op {
                    UnaryOp::Neg => self.writer.insn1("neg", Reg("rax")),
                    UnaryOp::BitNot => self.writer.insn1("not", Reg("rax")),
                    UnaryOp::Not => {
                        self.writer.insn2("cmp", Reg("rax"), Imm(0));
                        self.writer.insn2("mov", Reg("rax"), Imm(0));
                        self.writer.insn1("sete", Reg("al"));
                    }
                }
            }
            Expr::PreInc { expr, .. } => self.gen_incdec(expr, 1, true)?,
            Expr::PreDec { expr, .. } => self.gen_incdec(expr, -1, true)?,
            Expr::PostInc { expr, .. } => self.gen_incdec(expr, 1, false)?,
            Expr::PostDec { expr, .. } => self.gen_incdec(expr, -1, false)?,
            Expr::Member { .. } | Expr::Index { .. } => {
                self.gen_addr(expr)?;
                self.load_sized(expr.ty(), Mem { base: "rax", disp: 0 });
            }
            Expr::Cast { expr, ty, .. } => {
                self.gen_expr(expr)?;
                self.emit_truncate_or_extend(*ty);
            }
            Expr::InitList { elements, .. } => {
                // `VarDecl` lowers `InitList` itself, member-by-member
                // against the declared type; reaching here means a brace
                // initializer showed up as an ordinary expression (e.g.
                // nested inside a call argument), where only first-element
                // fallback makes sense.
                if let Some(first) = elements.first() {
                    self.gen_expr(first)?;
                } else {
                    self.writer.insn2("mov", Reg("rax"), Imm(0));
                }
            }
            Expr::Sizeof { .. } => unreachable!("sizeof is folded to an Integer at parse time"),
        }
        Ok(())
    }

    fn load_identifier(&mut self, name: &str, ty: TypeId) {
        let offset = self.frame.offset_of(name);
        if offset != 0 || self.frame.offsets.contains_key(name) {
            self.load_sized(ty, Mem { base: "rbp", disp: offset });
        } else {
            self.load_sized(ty, RipRelative(name.to_string()));
        }
    }

    /// Load `mem` into `rax`, reading only `ty`'s byte width and then
    /// sign/zero-widening to a full 64-bit value the rest of codegen can
    /// treat uniformly. Reuses `emit_truncate_or_extend`'s widening, just
    /// fed from a narrower load instead of a wider one that needs cutting
    /// down, so a 1/2/4-byte access never reads adjacent memory.
    pub(super) fn load_sized(&mut self, ty: TypeId, mem: text_asm::Operand) {
        let size = self.types.size_of(ty);
        match size {
            1 | 2 | 4 => {
                self.writer.insn2("mov", Reg(sized_reg("rax", size)), mem);
                self.emit_truncate_or_extend(ty);
            }
            _ => self.writer.insn2("mov", Reg("rax"), mem),
        }
    }

    /// Store the low `ty`-sized bytes of `rax` into `mem`, the store-side
    /// counterpart of `load_sized`.
    pub(super) fn store_sized(&mut self, ty: TypeId, mem: text_asm::Operand) {
        self.store_reg_sized(ty, "rax", mem);
    }

    pub(super) fn store_reg_sized(&mut self, ty: TypeId, reg: &'static str, mem: text_asm::Operand) {
        let size = self.types.size_of(ty);
        match size {
            1 | 2 | 4 => self.writer.insn2("mov", mem, Reg(sized_reg(reg, size))),
            _ => self.writer.insn2("mov", mem, Reg(reg)),
        }
    }

    fn gen_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        match op {
            BinOp::LogAnd => return self.gen_short_circuit(lhs, rhs, true),
            BinOp::LogOr => return self.gen_short_circuit(lhs, rhs, false),
            _ => {}
        }
        if matches!(op, BinOp::Add | BinOp::Sub) {
            if let Some(scaled) = self.gen_pointer_arith(op, lhs, rhs)? {
                return Ok(scaled);
            }
        }
        self.gen_expr(lhs)?;
        self.writer.insn1("push", Reg("rax"));
        self.gen_expr(rhs)?;
        self.writer.insn2("mov", Reg("rcx"), Reg("rax"));
        self.writer.insn1("pop", Reg("rax"));
        self.emit_binary_op(op);
        Ok(())
    }

    /// `p + n`, `n + p`, `p - n` scale the integer side by `sizeof(*p)`;
    /// `p - q` (both pointers to the same element type) divides the byte
    /// difference by that size instead. Returns `None` when neither side is
    /// a pointer, so the caller falls back to ordinary arithmetic.
    fn gen_pointer_arith(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Option<()>, CompileError> {
        let lhs_ptr = self.types.is_pointer(lhs.ty());
        let rhs_ptr = self.types.is_pointer(rhs.ty());
        if !lhs_ptr && !rhs_ptr {
            return Ok(None);
        }
        if lhs_ptr && rhs_ptr {
            let elem_size = self.types.size_of(self.types.pointee(lhs.ty()).unwrap_or(lhs.ty())).max(1) as i64;
            self.gen_expr(lhs)?;
            self.writer.insn1("push", Reg("rax"));
            self.gen_expr(rhs)?;
            self.writer.insn2("mov", Reg("rcx"), Reg("rax"));
            self.writer.insn1("pop", Reg("rax"));
            self.writer.insn2("sub", Reg("rax"), Reg("rcx"));
            self.writer.insn0("cqo");
            self.writer.insn2("mov", Reg("rcx"), Imm(elem_size));
            self.writer.insn1("idiv", Reg("rcx"));
            return Ok(Some(()));
        }
        let (ptr_expr, int_expr, ptr_first) = if lhs_ptr { (lhs, rhs, true) } else { (rhs, lhs, false) };
        let elem_size = self.types.size_of(self.types.pointee(ptr_expr.ty()).unwrap_or(ptr_expr.ty())).max(1) as i64;
        self.gen_expr(ptr_expr)?;
        self.writer.insn1("push", Reg("rax"));
        self.gen_expr(int_expr)?;
        self.writer.insn2("imul", Reg("rax"), Imm(elem_size));
        self.writer.insn2("mov", Reg("rcx"), Reg("rax"));
        self.writer.insn1("pop", Reg("rax"));
        if ptr_first {
            self.emit_binary_op(op);
        } else {
            // `n - p` is not valid C; only `n + p` reaches here, so the
            // subtraction branch never flips operands.
            self.writer.insn2("add", Reg("rax"), Reg("rcx"));
        }
        Ok(Some(()))
    }

    /// `&&`/`||` short-circuit: the right operand is only evaluated if the
    /// left doesn't already decide the result.
    fn gen_short_circuit(&mut self, lhs: &Expr, rhs: &Expr, is_and: bool) -> Result<(), CompileError> {
        let short_label = self.new_label(if is_and { "and_false" } else { "or_true" });
        let end_label = self.new_label("logical_end");
        self.gen_expr(lhs)?;
        self.writer.insn2("cmp", Reg("rax"), Imm(0));
        if is_and {
            self.writer.insn1("je", Label(short_label.clone()));
        } else {
            self.writer.insn1("jne", Label(short_label.clone()));
        }
        self.gen_expr(rhs)?;
        self.writer.insn2("cmp", Reg("rax"), Imm(0));
        self.writer.insn2("mov", Reg("rax"), Imm(0));
        self.writer.insn1("setne", Reg("al"));
        self.writer.insn1("jmp", Label(end_label.clone()));
        self.writer.label(&short_label);
        self.writer.insn2("mov", Reg("rax"), Imm(if is_and { 0 } else { 1 }));
        self.writer.label(&end_label);
        Ok(())
    }

    fn emit_binary_op(&mut self, op: BinOp) {
        match op {
            BinOp::Add => self.writer.insn2("add", Reg("rax"), Reg("rcx")),
            BinOp::Sub => self.writer.insn2("sub", Reg("rax"), Reg("rcx")),
            BinOp::Mul => self.writer.insn2("imul", Reg("rax"), Reg("rcx")),
            BinOp::Div => {
                self.writer.insn0("cqo");
                self.writer.insn1("idiv", Reg("rcx"));
            }
            BinOp::Mod => {
                self.writer.insn0("cqo");
                self.writer.insn1("idiv", Reg("rcx"));
                self.writer.insn2("mov", Reg("rax"), Reg("rdx"));
            }
            BinOp::Shl => self.writer.insn2("sal", Reg("rax"), Reg("cl")),
            BinOp::Shr => self.writer.insn2("sar", Reg("rax"), Reg("cl")),
            BinOp::BitAnd => self.writer.insn2("and", Reg("rax"), Reg("rcx")),
            BinOp::BitOr => self.writer.insn2("or", Reg("rax"), Reg("rcx")),
            BinOp::BitXor => self.writer.insn2("xor", Reg("rax"), Reg("rcx")),
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                self.writer.insn2("cmp", Reg("rax"), Reg("rcx"));
                let set = match op {
                    BinOp::Lt => "setl",
                    BinOp::Gt => "setg",
                    BinOp::Le => "setle",
                    BinOp::Ge => "setge",
                    BinOp::Eq => "sete",
                    BinOp::Ne => "setne",
                    _ => unreachable!(),
                };
                self.writer.insn2("mov", Reg("rax"), Imm(0));
                self.writer.insn1(set, Reg("al"));
            }
            BinOp::LogAnd | BinOp::LogOr => unreachable!("handled by gen_short_circuit"),
        }
    }

    fn gen_incdec(&mut self, target: &Expr, delta: i64, prefix: bool) -> Result<(), CompileError> {
        let ty = target.ty();
        let delta = match self.types.pointee(ty) {
            Some(pointee) => delta * self.types.size_of(pointee).max(1) as i64,
            None => delta,
        };
        self.gen_addr(target)?;
        self.writer.insn2("mov", Reg("r10"), Reg("rax"));
        self.load_sized(ty, Mem { base: "r10", disp: 0 });
        if !prefix {
            self.writer.insn1("push", Reg("rax"));
        }
        self.writer.insn2("add", Reg("rax"), Imm(delta));
        self.store_sized(ty, Mem { base: "r10", disp: 0 });
        if !prefix {
            self.writer.insn1("pop", Reg("rax"));
        }
        Ok(())
    }

    fn gen_call(&mut self, callee: &str, args: &[Expr]) -> Result<(), CompileError> {
        let is_float = vec![false; args.len()];
        let locations = abi::classify_args(self.abi, &is_float);
        for arg in args.iter().rev() {
            self.gen_expr(arg)?;
            self.writer.insn1("push", Reg("rax"));
        }
        for loc in locations.into_iter().rev() {
            if let abi::ArgLocation::IntRegister(reg) = loc {
                self.writer.insn1("pop", Reg(reg));
            }
        }
        if self.abi.shadow_space() > 0 {
            self.writer.insn2("sub", Reg("rsp"), Imm(self.abi.shadow_space() as i64));
        }
        self.writer.insn2("mov", Reg("rax"), Imm(0)); // AL = vector-register count for variadics (SysV)
        self.writer.insn1("call", Label(callee.to_string()));
        if self.abi.shadow_space() > 0 {
            self.writer.insn2("add", Reg("rsp"), Imm(self.abi.shadow_space() as i64));
        }
        Ok(())
    }

    /// Compute the address of an lvalue into `rax`.
    pub(super) fn gen_addr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Identifier { name, .. } => {
                let offset = self.frame.offset_of(name);
                if offset != 0 || self.frame.offsets.contains_key(name) {
                    self.writer.insn2("lea", Reg("rax"), Mem { base: "rbp", disp: offset });
                } else {
                    self.writer.insn2("lea", Reg("rax"), RipRelative(name.clone()));
                }
            }
            Expr::Deref { expr, .. } => {
                self.gen_expr(expr)?;
            }
            Expr::Index { base, index, ty, .. } => {
                self.gen_expr(base)?;
                self.writer.insn1("push", Reg("rax"));
                self.gen_expr(index)?;
                let elem_size = self.types.size_of(*ty).max(1) as i64;
                self.writer.insn2("imul", Reg("rax"), Imm(elem_size));
                self.writer.insn2("mov", Reg("rcx"), Reg("rax"));
                self.writer.insn1("pop", Reg("rax"));
                self.writer.insn2("add", Reg("rax"), Reg("rcx"));
            }
            Expr::Member { base, name, is_arrow, .. } => {
                if *is_arrow {
                    self.gen_expr(base)?;
                } else {
                    self.gen_addr(base)?;
                }
                let base_ty = if *is_arrow {
                    self.types.pointee(base.ty()).unwrap_or_else(|| base.ty())
                } else {
                    base.ty()
                };
                let offset = self.types.member(base_ty, name).map(|m| m.offset).unwrap_or(0) as i64;
                if offset != 0 {
                    self.writer.insn2("add", Reg("rax"), Imm(offset));
                }
            }
            other => {
                return Err(CompileError::codegen(format!(
                    "expression is not assignable: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    fn store_to_lvalue(&mut self, lvalue: &Expr) -> Result<(), CompileError> {
        self.writer.insn1("push", Reg("rax"));
        self.gen_addr(lvalue)?;
        self.writer.insn2("mov", Reg("r10"), Reg("rax"));
        self.writer.insn1("pop", Reg("rax"));
        self.store_sized(lvalue.ty(), Mem { base: "r10", disp: 0 });
        Ok(())
    }

    /// Sign-extend an integer already in `rax` to match `ty`'s width
    /// (float<->int conversion is a Non-goal for this pass).
    fn emit_truncate_or_extend(&mut self, ty: TypeId) {
        let size = self.types.size_of(ty);
        match size {
            1 => self.writer.insn2("movsbq", Reg("rax"), Reg("al")),
            2 => self.writer.insn2("movswq", Reg("rax"), Reg("ax")),
            4 => self.writer.insn2("movslq", Reg("rax"), Reg("eax")),
            _ => {}
        }
    }
}

/// The sub-register name for `reg` at `size` bytes, the way `al`/`ax`/`eax`
/// name progressively wider views of `rax`. Passed through unchanged for an
/// 8-byte access or a register with no narrower encoding.
fn sized_reg(reg: &'static str, size: u32) -> &'static str {
    match (reg, size) {
        ("rax", 1) => "al",
        ("rax", 2) => "ax",
        ("rax", 4) => "eax",
        ("rcx", 1) => "cl",
        ("rcx", 2) => "cx",
        ("rcx", 4) => "ecx",
        ("rdx", 1) => "dl",
        ("rdx", 2) => "dx",
        ("rdx", 4) => "edx",
        ("rbx", 1) => "bl",
        ("rbx", 2) => "bx",
        ("rbx", 4) => "ebx",
        ("rsi", 1) => "sil",
        ("rsi", 2) => "si",
        ("rsi", 4) => "esi",
        ("rdi", 1) => "dil",
        ("rdi", 2) => "di",
        ("rdi", 4) => "edi",
        ("r8", 1) => "r8b",
        ("r8", 2) => "r8w",
        ("r8", 4) => "r8d",
        ("r9", 1) => "r9b",
        ("r9", 2) => "r9w",
        ("r9", 4) => "r9d",
        ("r10", 1) => "r10b",
        ("r10", 2) => "r10w",
        ("r10", 4) => "r10d",
        ("r11", 1) => "r11b",
        ("r11", 2) => "r11w",
        ("r11", 4) => "r11d",
        (other, _) => other,
    }
}
