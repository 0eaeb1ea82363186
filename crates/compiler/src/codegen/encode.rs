//! Direct x86-64 instruction encoding for `--obj` and the default linked
//! executable path. Where `text_asm` builds a string for
//! an external assembler to consume, this module builds bytes and
//! relocation records directly, so `fixc` never shells out to `as`/`ld`
//! the way a bootstrap-era toolchain might.
//!
//! Only the REX-prefixed 64-bit register forms are needed: the subset's
//! values are always `long`-or-narrower and every local lives in a
//! `rbp`-relative slot, so no SIB-byte addressing (no array-of-struct
//! base+index+scale in one instruction) is required here; `expr.rs`
//! already lowers indexing into separate `add`/`imul` steps before the
//! final load/store.

use crate::error::CompileError;
use std::collections::HashMap;

/// One 64-bit general-purpose register, numbered the way the ModRM/REX
/// encoding expects (low 3 bits in ModRM, high bit in REX.B/R/X).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
}

impl Reg {
    fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    fn needs_rex_b(self) -> bool {
        (self as u8) >= 8
    }
}

/// A fixup the linker (or, for `--obj`, the object writer's relocation
/// table) must resolve once the target symbol's address is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset within the function's code buffer where the 32-bit
    /// displacement/address to patch begins.
    pub offset: u32,
    pub symbol: String,
    pub kind: RelocationKind,
    /// Added to the resolved value before patching (e.g. `-4` for a
    /// PC-relative `call` whose displacement is measured from the byte
    /// *after* the patched field).
    pub addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// 32-bit signed displacement relative to the next instruction
    /// (`call`, `jmp rel32`, RIP-relative `lea`).
    Pc32,
    /// Absolute 32-bit address (only valid for non-PIE executables, which
    /// is all this target produces).
    Abs32,
}

/// Accumulated machine code plus the relocations it needs, for one
/// function body.
#[derive(Debug, Default)]
pub struct EncodedFunction {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
    /// Byte offset of each internal label, resolved once the whole
    /// function has been encoded (forward jumps are patched in a second
    /// pass, the way a single-pass assembler with backpatching works).
    pub labels: HashMap<String, u32>,
}

struct PendingLabelRef {
    offset: u32,
    label: String,
}

pub struct Encoder {
    bytes: Vec<u8>,
    relocations: Vec<Relocation>,
    labels: HashMap<String, u32>,
    pending: Vec<PendingLabelRef>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            bytes: Vec::new(),
            relocations: Vec::new(),
            labels: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.offset());
    }

    fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn push_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let byte = 0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8);
        self.push(byte);
    }

    fn modrm_reg_reg(&mut self, reg: u8, rm: u8) {
        self.push(0xC0 | (reg << 3) | rm);
    }

    /// `[rbp + disp]`, ModRM mod=01/10 depending on displacement size.
    fn modrm_reg_mem_rbp(&mut self, reg: u8, disp: i32) {
        if (-128..=127).contains(&disp) {
            self.push(0x40 | (reg << 3) | Reg::Rbp.low3());
            self.push(disp as i8 as u8);
        } else {
            self.push(0x80 | (reg << 3) | Reg::Rbp.low3());
            self.push_i32(disp);
        }
    }

    pub fn push_reg(&mut self, reg: Reg) {
        if reg.needs_rex_b() {
            self.rex(false, false, false, true);
        }
        self.push(0x50 | reg.low3());
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        if reg.needs_rex_b() {
            self.rex(false, false, false, true);
        }
        self.push(0x58 | reg.low3());
    }

    /// `mov dst, src` (both 64-bit registers).
    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_b(), false, dst.needs_rex_b());
        self.push(0x89);
        self.modrm_reg_reg(src.low3(), dst.low3());
    }

    /// `mov dst, imm32` sign-extended to 64 bits.
    pub fn mov_reg_imm32(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, false, dst.needs_rex_b());
        self.push(0xC7);
        self.push(0xC0 | dst.low3());
        self.push_i32(imm);
    }

    /// `mov dst, [rbp + disp]`.
    pub fn mov_reg_from_rbp(&mut self, dst: Reg, disp: i32) {
        self.rex(true, dst.needs_rex_b(), false, false);
        self.push(0x8B);
        self.modrm_reg_mem_rbp(dst.low3(), disp);
    }

    /// `mov [rbp + disp], src`.
    pub fn mov_rbp_from_reg(&mut self, disp: i32, src: Reg) {
        self.rex(true, src.needs_rex_b(), false, false);
        self.push(0x89);
        self.modrm_reg_mem_rbp(src.low3(), disp);
    }

    /// `mov dst, [rbp + disp]` reading only `size` bytes (1, 2, or 4) and
    /// sign-extending to fill the 64-bit `dst`; `size == 8` falls back to
    /// the plain 64-bit load. Keeps narrower locals (`char`, `short`,
    /// `int`) from pulling in whatever garbage sits past their slot.
    pub fn mov_reg_from_rbp_sized(&mut self, dst: Reg, disp: i32, size: u32) {
        match size {
            1 => {
                self.rex(true, dst.needs_rex_b(), false, false);
                self.push(0x0F);
                self.push(0xBE);
                self.modrm_reg_mem_rbp(dst.low3(), disp);
            }
            2 => {
                self.rex(true, dst.needs_rex_b(), false, false);
                self.push(0x0F);
                self.push(0xBF);
                self.modrm_reg_mem_rbp(dst.low3(), disp);
            }
            4 => {
                self.rex(true, dst.needs_rex_b(), false, false);
                self.push(0x63); // movsxd
                self.modrm_reg_mem_rbp(dst.low3(), disp);
            }
            _ => self.mov_reg_from_rbp(dst, disp),
        }
    }

    /// `mov [rbp + disp], src` writing only `size` bytes (1, 2, or 4) of
    /// `src`; `size == 8` falls back to the plain 64-bit store. The
    /// store-side counterpart of `mov_reg_from_rbp_sized` — without this,
    /// a narrow field store clobbers whatever follows it in the frame.
    pub fn mov_rbp_from_reg_sized(&mut self, disp: i32, src: Reg, size: u32) {
        match size {
            1 => {
                self.rex(false, src.needs_rex_b(), false, false);
                self.push(0x88);
                self.modrm_reg_mem_rbp(src.low3(), disp);
            }
            2 => {
                self.push(0x66);
                self.rex(false, src.needs_rex_b(), false, false);
                self.push(0x89);
                self.modrm_reg_mem_rbp(src.low3(), disp);
            }
            4 => {
                self.rex(false, src.needs_rex_b(), false, false);
                self.push(0x89);
                self.modrm_reg_mem_rbp(src.low3(), disp);
            }
            _ => self.mov_rbp_from_reg(disp, src),
        }
    }

    /// `lea dst, [rbp + disp]`.
    pub fn lea_reg_rbp(&mut self, dst: Reg, disp: i32) {
        self.rex(true, dst.needs_rex_b(), false, false);
        self.push(0x8D);
        self.modrm_reg_mem_rbp(dst.low3(), disp);
    }

    pub fn add_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_b(), false, dst.needs_rex_b());
        self.push(0x01);
        self.modrm_reg_reg(src.low3(), dst.low3());
    }

    pub fn sub_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_b(), false, dst.needs_rex_b());
        self.push(0x29);
        self.modrm_reg_reg(src.low3(), dst.low3());
    }

    pub fn sub_reg_imm32(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, false, dst.needs_rex_b());
        self.push(0x81);
        self.push(0xE8 | dst.low3());
        self.push_i32(imm);
    }

    pub fn add_reg_imm32(&mut self, dst: Reg, imm: i32) {
        self.rex(true, false, false, dst.needs_rex_b());
        self.push(0x81);
        self.push(0xC0 | dst.low3());
        self.push_i32(imm);
    }

    pub fn cmp_reg_reg(&mut self, lhs: Reg, rhs: Reg) {
        self.rex(true, rhs.needs_rex_b(), false, lhs.needs_rex_b());
        self.push(0x39);
        self.modrm_reg_reg(rhs.low3(), lhs.low3());
    }

    pub fn cmp_reg_imm32(&mut self, lhs: Reg, imm: i32) {
        self.rex(true, false, false, lhs.needs_rex_b());
        self.push(0x81);
        self.push(0xF8 | lhs.low3());
        self.push_i32(imm);
    }

    pub fn xor_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_b(), false, dst.needs_rex_b());
        self.push(0x31);
        self.modrm_reg_reg(src.low3(), dst.low3());
    }

    pub fn neg_reg(&mut self, dst: Reg) {
        self.rex(true, false, false, dst.needs_rex_b());
        self.push(0xF7);
        self.push(0xD8 | dst.low3());
    }

    pub fn not_reg(&mut self, dst: Reg) {
        self.rex(true, false, false, dst.needs_rex_b());
        self.push(0xF7);
        self.push(0xD0 | dst.low3());
    }

    pub fn and_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_b(), false, dst.needs_rex_b());
        self.push(0x21);
        self.modrm_reg_reg(src.low3(), dst.low3());
    }

    pub fn or_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.needs_rex_b(), false, dst.needs_rex_b());
        self.push(0x09);
        self.modrm_reg_reg(src.low3(), dst.low3());
    }

    /// `imul dst, src` (two-operand form, `0F AF`).
    pub fn imul_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.needs_rex_b(), false, src.needs_rex_b());
        self.push(0x0F);
        self.push(0xAF);
        self.modrm_reg_reg(dst.low3(), src.low3());
    }

    /// `cqo`: sign-extend `rax` into `rdx:rax`, ahead of `idiv`.
    pub fn cqo(&mut self) {
        self.rex(true, false, false, false);
        self.push(0x99);
    }

    /// `idiv divisor`: `rdx:rax / divisor -> rax` remainder `rdx`.
    pub fn idiv_reg(&mut self, divisor: Reg) {
        self.rex(true, false, false, divisor.needs_rex_b());
        self.push(0xF7);
        self.push(0xF8 | divisor.low3());
    }

    /// `setCC al` (byte set-on-condition); `cc` is the raw ModRM opcode
    /// byte following `0F 9x`.
    pub fn setcc_al(&mut self, cc: u8) {
        self.push(0x0F);
        self.push(0x90 | cc);
        self.push(0xC0 | Reg::Rax.low3());
    }

    pub fn ret(&mut self) {
        self.push(0xC3);
    }

    /// `jmp rel32` to a forward or backward label, patched once the whole
    /// function's labels are known.
    pub fn jmp(&mut self, label: &str) {
        self.push(0xE9);
        self.pending.push(PendingLabelRef { offset: self.offset(), label: label.to_string() });
        self.push_i32(0);
    }

    /// `je rel32` (`0F 84`).
    pub fn je(&mut self, label: &str) {
        self.push(0x0F);
        self.push(0x84);
        self.pending.push(PendingLabelRef { offset: self.offset(), label: label.to_string() });
        self.push_i32(0);
    }

    pub fn jne(&mut self, label: &str) {
        self.push(0x0F);
        self.push(0x85);
        self.pending.push(PendingLabelRef { offset: self.offset(), label: label.to_string() });
        self.push_i32(0);
    }

    /// `call rel32`, recorded as a relocation against an external or
    /// not-yet-placed symbol rather than backpatched locally: the
    /// object/linker stage resolves it.
    pub fn call_symbol(&mut self, symbol: &str) {
        self.push(0xE8);
        let offset = self.offset();
        self.relocations.push(Relocation {
            offset,
            symbol: symbol.to_string(),
            kind: RelocationKind::Pc32,
            addend: -4,
        });
        self.push_i32(0);
    }

    /// Resolve every local-label jump recorded via `jmp`/`je`/`jne` against
    /// `self.labels`. Must run after the whole function body is encoded.
    fn backpatch(&mut self) -> Result<(), CompileError> {
        for pending in &self.pending {
            let target = *self
                .labels
                .get(&pending.label)
                .ok_or_else(|| CompileError::codegen(format!("unresolved label {}", pending.label)))?;
            let next_insn = pending.offset + 4;
            let rel = target as i64 - next_insn as i64;
            let rel = i32::try_from(rel)
                .map_err(|_| CompileError::codegen(format!("branch to {} out of i32 range", pending.label)))?;
            self.bytes[pending.offset as usize..pending.offset as usize + 4]
                .copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<EncodedFunction, CompileError> {
        self.backpatch()?;
        Ok(EncodedFunction { bytes: self.bytes, relocations: self.relocations, labels: self.labels })
    }
}

/// Encode the standard `push rbp; mov rbp, rsp` prologue and matching
/// epilogue, shared by every function regardless of body contents.
pub fn encode_prologue(enc: &mut Encoder, locals_size: u32) {
    enc.push_reg(Reg::Rbp);
    enc.mov_reg_reg(Reg::Rbp, Reg::Rsp);
    if locals_size > 0 {
        enc.sub_reg_imm32(Reg::Rsp, locals_size as i32);
    }
}

pub fn encode_epilogue(enc: &mut Encoder) {
    enc.mov_reg_reg(Reg::Rsp, Reg::Rbp);
    enc.pop_reg(Reg::Rbp);
    enc.ret();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_reg_imm32_emits_rex_w_and_c7_c0() {
        let mut enc = Encoder::new();
        enc.mov_reg_imm32(Reg::Rax, 42);
        assert_eq!(enc.bytes[0], 0x48);
        assert_eq!(enc.bytes[1], 0xC7);
        assert_eq!(enc.bytes[2], 0xC0);
    }

    #[test]
    fn extended_register_sets_rex_b() {
        let mut enc = Encoder::new();
        enc.push_reg(Reg::R10);
        assert_eq!(enc.bytes[0], 0x41);
        assert_eq!(enc.bytes[1], 0x50 | Reg::R10.low3());
    }

    #[test]
    fn forward_jump_is_backpatched_to_correct_relative_offset() {
        let mut enc = Encoder::new();
        enc.jmp("end");
        enc.mov_reg_imm32(Reg::Rax, 1);
        enc.label("end");
        enc.ret();
        let encoded = enc.finish().unwrap();
        let rel = i32::from_le_bytes(encoded.bytes[1..5].try_into().unwrap());
        assert_eq!(rel, encoded.bytes.len() as i32 - 5);
    }

    #[test]
    fn call_records_a_pc32_relocation_with_addend_minus_four() {
        let mut enc = Encoder::new();
        enc.call_symbol("printf");
        let encoded = enc.finish().unwrap();
        assert_eq!(encoded.relocations.len(), 1);
        assert_eq!(encoded.relocations[0].symbol, "printf");
        assert_eq!(encoded.relocations[0].addend, -4);
        assert_eq!(encoded.relocations[0].kind, RelocationKind::Pc32);
    }

    #[test]
    fn imul_two_operand_form_uses_0f_af() {
        let mut enc = Encoder::new();
        enc.imul_reg_reg(Reg::Rax, Reg::Rcx);
        assert_eq!(enc.bytes[1], 0x0F);
        assert_eq!(enc.bytes[2], 0xAF);
    }

    #[test]
    fn setcc_only_ever_touches_al() {
        let mut enc = Encoder::new();
        enc.setcc_al(0x4); // sete
        assert_eq!(enc.bytes, vec![0x0F, 0x94, 0xC0]);
    }

    #[test]
    fn byte_sized_store_uses_0x88_not_0x89() {
        let mut enc = Encoder::new();
        enc.mov_rbp_from_reg_sized(-1, Reg::Rax, 1);
        assert!(enc.bytes.contains(&0x88));
    }

    #[test]
    fn dword_sized_load_uses_movsxd_not_plain_mov() {
        let mut enc = Encoder::new();
        enc.mov_reg_from_rbp_sized(Reg::Rax, -4, 4);
        assert_eq!(enc.bytes[1], 0x63);
    }

    #[test]
    fn eight_byte_sized_store_falls_back_to_plain_mov() {
        let mut enc = Encoder::new();
        enc.mov_rbp_from_reg_sized(-8, Reg::Rax, 8);
        assert_eq!(enc.bytes[1], 0x89);
    }

    #[test]
    fn prologue_then_epilogue_round_trips_rsp_through_rbp() {
        let mut enc = Encoder::new();
        encode_prologue(&mut enc, 16);
        encode_epilogue(&mut enc);
        let encoded = enc.finish().unwrap();
        assert!(!encoded.bytes.is_empty());
        assert_eq!(*encoded.bytes.last().unwrap(), 0xC3);
    }
}
