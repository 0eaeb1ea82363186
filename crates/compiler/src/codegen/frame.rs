//! Stack frame layout.
//!
//! One `rbp`-relative slot per local and per spilled parameter, laid out
//! in declaration order and aligned to each slot's natural alignment. No
//! attempt is made to pack locals more tightly than that: register
//! allocation and stack-slot reuse are out of scope.

use crate::ast::{Declarator, Function, Param, Stmt};
use crate::codegen::abi::Abi;
use crate::types::TypeTable;
use std::collections::HashMap;

/// Negative-offset-from-`rbp` slot assignment for one function's locals
/// and parameters.
pub struct Frame {
    pub offsets: HashMap<String, i32>,
    /// Total bytes below `rbp` reserved for locals, 16-byte aligned.
    pub locals_size: u32,
    pub abi: Abi,
}

impl Frame {
    pub fn build(function: &Function, types: &TypeTable, abi: Abi) -> Self {
        let mut offsets = HashMap::new();
        let mut cursor: i32 = 0;

        for param in &function.params {
            cursor -= slot_size(param_size(param, types)) as i32;
            offsets.insert(param.name.clone(), cursor);
        }

        if let Some(body) = &function.body {
            collect_locals(body, types, &mut cursor, &mut offsets);
        }

        let locals_size = align_up((-cursor) as u32, 16);
        Frame { offsets, locals_size, abi }
    }

    pub fn offset_of(&self, name: &str) -> i32 {
        *self.offsets.get(name).unwrap_or(&0)
    }
}

fn param_size(param: &Param, types: &TypeTable) -> u32 {
    types.size_of(param.ty)
}

fn collect_locals(
    stmt: &Stmt,
    types: &TypeTable,
    cursor: &mut i32,
    offsets: &mut HashMap<String, i32>,
) {
    match stmt {
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_locals(s, types, cursor, offsets);
            }
        }
        Stmt::VarDecl(decl) => {
            assign_slot(decl, types, cursor, offsets);
        }
        Stmt::If { then, els, .. } => {
            collect_locals(then, types, cursor, offsets);
            if let Some(e) = els {
                collect_locals(e, types, cursor, offsets);
            }
        }
        Stmt::While { body, .. } => collect_locals(body, types, cursor, offsets),
        Stmt::For { init, body, .. } => {
            if let Some(init) = init {
                collect_locals(init, types, cursor, offsets);
            }
            collect_locals(body, types, cursor, offsets);
        }
        Stmt::Switch { body, .. } => collect_locals(body, types, cursor, offsets),
        Stmt::Case { body, .. } | Stmt::Default { body } => collect_locals(body, types, cursor, offsets),
        Stmt::Expr(_) | Stmt::Return(_) | Stmt::Break | Stmt::Continue => {}
    }
}

fn assign_slot(decl: &Declarator, types: &TypeTable, cursor: &mut i32, offsets: &mut HashMap<String, i32>) {
    let size = types.size_of(decl.ty);
    let align = types.align_of(decl.ty).max(1);
    let mut next = *cursor - slot_size(size) as i32;
    next -= next.rem_euclid(align as i32);
    *cursor = next;
    offsets.insert(decl.name.clone(), *cursor);
}

fn slot_size(size: u32) -> u32 {
    size.max(1)
}

fn align_up(offset: u32, align: u32) -> u32 {
    if align == 0 {
        return offset;
    }
    offset.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SourceLocation;
    use fixc_core::Target;

    fn loc() -> SourceLocation {
        SourceLocation { line: 1 }
    }

    #[test]
    fn parameters_get_negative_offsets_before_locals() {
        let types = TypeTable::new(Target::linux64());
        let int = types.int();
        let function = Function {
            name: "f".into(),
            ret: int,
            params: vec![Param { name: "a".into(), ty: int }],
            variadic: false,
            body: Some(Stmt::Block(vec![Stmt::VarDecl(Declarator {
                name: "x".into(),
                ty: int,
                init: None,
                loc: loc(),
            })])),
            is_extern: false,
            loc: loc(),
        };
        let frame = Frame::build(&function, &types, Abi::SysV);
        assert!(frame.offset_of("a") < 0);
        assert!(frame.offset_of("x") < frame.offset_of("a"));
    }

    #[test]
    fn locals_size_is_16_byte_aligned() {
        let types = TypeTable::new(Target::linux64());
        let char_ty = types.char_ty();
        let function = Function {
            name: "f".into(),
            ret: char_ty,
            params: vec![],
            variadic: false,
            body: Some(Stmt::Block(vec![Stmt::VarDecl(Declarator {
                name: "c".into(),
                ty: char_ty,
                init: None,
                loc: loc(),
            })])),
            is_extern: false,
            loc: loc(),
        };
        let frame = Frame::build(&function, &types, Abi::SysV);
        assert_eq!(frame.locals_size % 16, 0);
    }
}
