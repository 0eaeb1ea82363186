//! Calling-convention parameter classification.
//!
//! System V x86-64 and Win64 agree on using registers for the first few
//! integer/pointer arguments, then the stack, but disagree on which
//! registers, how many, and whether the caller must reserve "shadow
//! space". Both conventions are modeled here as a single `Abi` enum rather
//! than two structs, so `frame.rs` and `expr.rs` can match on it directly.

/// Integer/pointer argument-passing registers, in argument order.
const SYSV_INT_REGS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
const WIN64_INT_REGS: [&str; 4] = ["rcx", "rdx", "r8", "r9"];

/// Floating-point argument registers.
const SYSV_FLOAT_REGS: [&str; 8] = ["xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7"];
const WIN64_FLOAT_REGS: [&str; 4] = ["xmm0", "xmm1", "xmm2", "xmm3"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    SysV,
    Win64,
}

impl Abi {
    pub fn int_registers(self) -> &'static [&'static str] {
        match self {
            Abi::SysV => &SYSV_INT_REGS,
            Abi::Win64 => &WIN64_INT_REGS,
        }
    }

    pub fn float_registers(self) -> &'static [&'static str] {
        match self {
            Abi::SysV => &SYSV_FLOAT_REGS,
            Abi::Win64 => &WIN64_FLOAT_REGS,
        }
    }

    /// Win64 reserves 32 bytes ("shadow space") above the return address
    /// for the callee to spill its register arguments into, even when the
    /// callee never uses all four registers. SysV has no equivalent.
    pub fn shadow_space(self) -> u32 {
        match self {
            Abi::SysV => 0,
            Abi::Win64 => 32,
        }
    }

    /// Win64 counts variadic float arguments against the integer-register
    /// slot at the same position (a float argument in slot 2 still
    /// consumes `rdx`'s slot, duplicated into `xmm2`). SysV instead spills
    /// all variadic float arguments to `xmm0..xmm7` independently of the
    /// integer registers, and requires `al` to hold the vector-register
    /// count used.
    pub fn variadic_float_shares_integer_slot(self) -> bool {
        matches!(self, Abi::Win64)
    }

    /// Number of register slots available before arguments spill to the
    /// stack.
    pub fn register_slot_count(self) -> usize {
        match self {
            Abi::SysV => 6,
            Abi::Win64 => 4,
        }
    }
}

/// Where one argument ends up: a register by name, or a stack slot at a
/// byte offset from the first stack argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    IntRegister(&'static str),
    FloatRegister(&'static str),
    Stack(u32),
}

/// Classify each of `arg_is_float` (true = float/double) into a location,
/// in order. Win64 always advances both register files together per spec
/// §4.4; SysV advances them independently.
pub fn classify_args(abi: Abi, arg_is_float: &[bool]) -> Vec<ArgLocation> {
    let mut out = Vec::with_capacity(arg_is_float.len());
    let mut stack_offset: u32 = 0;
    match abi {
        Abi::Win64 => {
            let int_regs = abi.int_registers();
            let float_regs = abi.float_registers();
            for (i, &is_float) in arg_is_float.iter().enumerate() {
                if i < abi.register_slot_count() {
                    out.push(if is_float {
                        ArgLocation::FloatRegister(float_regs[i])
                    } else {
                        ArgLocation::IntRegister(int_regs[i])
                    });
                } else {
                    out.push(ArgLocation::Stack(stack_offset));
                    stack_offset += 8;
                }
            }
        }
        Abi::SysV => {
            let int_regs = abi.int_registers();
            let float_regs = abi.float_registers();
            let mut next_int = 0usize;
            let mut next_float = 0usize;
            for &is_float in arg_is_float {
                if is_float && next_float < float_regs.len() {
                    out.push(ArgLocation::FloatRegister(float_regs[next_float]));
                    next_float += 1;
                } else if !is_float && next_int < int_regs.len() {
                    out.push(ArgLocation::IntRegister(int_regs[next_int]));
                    next_int += 1;
                } else {
                    out.push(ArgLocation::Stack(stack_offset));
                    stack_offset += 8;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_uses_six_integer_registers_then_stack() {
        let locs = classify_args(Abi::SysV, &[false; 7]);
        assert_eq!(locs[0], ArgLocation::IntRegister("rdi"));
        assert_eq!(locs[5], ArgLocation::IntRegister("r9"));
        assert_eq!(locs[6], ArgLocation::Stack(0));
    }

    #[test]
    fn win64_uses_four_integer_registers_then_stack() {
        let locs = classify_args(Abi::Win64, &[false; 5]);
        assert_eq!(locs[0], ArgLocation::IntRegister("rcx"));
        assert_eq!(locs[3], ArgLocation::IntRegister("r9"));
        assert_eq!(locs[4], ArgLocation::Stack(0));
    }

    #[test]
    fn sysv_advances_int_and_float_registers_independently() {
        let locs = classify_args(Abi::SysV, &[true, false, true]);
        assert_eq!(locs[0], ArgLocation::FloatRegister("xmm0"));
        assert_eq!(locs[1], ArgLocation::IntRegister("rdi"));
        assert_eq!(locs[2], ArgLocation::FloatRegister("xmm1"));
    }

    #[test]
    fn win64_shadow_space_is_32_bytes_sysv_is_zero() {
        assert_eq!(Abi::Win64.shadow_space(), 32);
        assert_eq!(Abi::SysV.shadow_space(), 0);
    }
}
