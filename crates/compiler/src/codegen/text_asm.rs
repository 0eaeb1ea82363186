//! Textual assembly emission in both AT&T and Intel syntax.
//!
//! `expr.rs`/`stmt.rs` build instructions against this module's
//! syntax-neutral `Operand` values; only this module knows that AT&T
//! writes `mnemonic src, dst` with `%`/`$` sigils while Intel writes
//! `mnemonic dst, src` with bare names.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    AttT,
    Intel,
}

#[derive(Debug, Clone)]
pub enum Operand {
    Reg(&'static str),
    Imm(i64),
    /// `disp(%base)` / `[base+disp]`.
    Mem { base: &'static str, disp: i32 },
    /// A bare label reference, e.g. for `call`/`jmp`/`lea sym(%rip)`.
    Label(String),
    /// RIP-relative data reference, e.g. `sym(%rip)` / `[rip+sym]`.
    RipRelative(String),
}

pub struct AsmWriter {
    pub syntax: Syntax,
    pub lines: Vec<String>,
}

impl AsmWriter {
    pub fn new(syntax: Syntax) -> Self {
        AsmWriter { syntax, lines: Vec::new() }
    }

    pub fn raw(&mut self, text: impl Into<String>) {
        self.lines.push(text.into());
    }

    pub fn label(&mut self, name: &str) {
        self.lines.push(format!("{}:", name));
    }

    pub fn insn0(&mut self, mnemonic: &str) {
        self.lines.push(format!("    {}", mnemonic));
    }

    pub fn insn1(&mut self, mnemonic: &str, operand: Operand) {
        self.lines.push(format!("    {} {}", mnemonic, self.fmt(&operand)));
    }

    /// `dst = mnemonic(dst, src)`. AT&T prints the operands reversed.
    pub fn insn2(&mut self, mnemonic: &str, dst: Operand, src: Operand) {
        let (a, b) = match self.syntax {
            Syntax::AttT => (self.fmt(&src), self.fmt(&dst)),
            Syntax::Intel => (self.fmt(&dst), self.fmt(&src)),
        };
        self.lines.push(format!("    {} {}, {}", mnemonic, a, b));
    }

    fn fmt(&self, op: &Operand) -> String {
        match (self.syntax, op) {
            (Syntax::AttT, Operand::Reg(r)) => format!("%{}", r),
            (Syntax::Intel, Operand::Reg(r)) => r.to_string(),
            (Syntax::AttT, Operand::Imm(v)) => format!("${}", v),
            (Syntax::Intel, Operand::Imm(v)) => v.to_string(),
            (Syntax::AttT, Operand::Mem { base, disp }) => {
                if *disp == 0 {
                    format!("(%{})", base)
                } else {
                    format!("{}(%{})", disp, base)
                }
            }
            (Syntax::Intel, Operand::Mem { base, disp }) => {
                if *disp == 0 {
                    format!("[{}]", base)
                } else if *disp > 0 {
                    format!("[{}+{}]", base, disp)
                } else {
                    format!("[{}{}]", base, disp)
                }
            }
            (Syntax::AttT, Operand::Label(l)) => l.clone(),
            (Syntax::Intel, Operand::Label(l)) => l.clone(),
            (Syntax::AttT, Operand::RipRelative(sym)) => format!("{}(%rip)", sym),
            (Syntax::Intel, Operand::RipRelative(sym)) => format!("[rip+{}]", sym),
        }
    }

    /// Assembler directives differ in spelling between the two syntaxes
    /// only at the file header; the body mnemonics above are otherwise
    /// identical once operand order is fixed up.
    pub fn file_header(&mut self, target_comment: &str) {
        match self.syntax {
            Syntax::AttT => self.raw(format!("# {}", target_comment)),
            Syntax::Intel => {
                self.raw(format!("; {}", target_comment));
                self.raw(".intel_syntax noprefix");
            }
        }
    }

    pub fn section(&mut self, name: &str) {
        self.raw(format!(".section {}", name));
    }

    pub fn global(&mut self, symbol: &str) {
        self.raw(format!(".globl {}", symbol));
    }

    pub fn finish(self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn att_t_reverses_operand_order_with_sigils() {
        let mut w = AsmWriter::new(Syntax::AttT);
        w.insn2("mov", Operand::Reg("rax"), Operand::Imm(5));
        assert_eq!(w.lines[0], "    mov $5, %rax");
    }

    #[test]
    fn intel_keeps_dst_src_order_without_sigils() {
        let mut w = AsmWriter::new(Syntax::Intel);
        w.insn2("mov", Operand::Reg("rax"), Operand::Imm(5));
        assert_eq!(w.lines[0], "    mov rax, 5");
    }

    #[test]
    fn memory_operand_differs_by_syntax() {
        let mut att = AsmWriter::new(Syntax::AttT);
        att.insn2("mov", Operand::Reg("rax"), Operand::Mem { base: "rbp", disp: -8 });
        assert_eq!(att.lines[0], "    mov -8(%rbp), %rax");

        let mut intel = AsmWriter::new(Syntax::Intel);
        intel.insn2("mov", Operand::Reg("rax"), Operand::Mem { base: "rbp", disp: -8 });
        assert_eq!(intel.lines[0], "    mov rax, [rbp-8]");
    }
}
