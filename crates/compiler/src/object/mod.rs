//! Relocatable object-file writers.
//!
//! `codegen::emit_object` produces per-function bytes and symbol-relative
//! fixups; this module's two submodules turn that into a container a
//! linker (including this project's own, in `linker/`) can consume:
//! `elf.rs` for Linux/System V targets, `coff.rs` for Windows targets.
//! Both read the same `Relocation` shape from `codegen::encode` and
//! translate its single `Pc32` kind into the container-specific
//! relocation-type constant.

pub mod coff;
pub mod elf;

use crate::codegen::encode::{EncodedFunction, RelocationKind};

/// One function or global ready to be placed into a section.
pub struct ObjectSymbol {
    pub name: String,
    /// Byte offset within the section this symbol's bytes start at.
    pub offset: u32,
    pub size: u32,
    pub is_function: bool,
    /// `false` for symbols defined in this translation unit; `true` for
    /// externs referenced only through a relocation (e.g. `printf`).
    pub is_extern: bool,
}

/// Flattened view of one translation unit's code, ready for either
/// object-format writer: every function's bytes concatenated into one
/// `.text` blob, with relocations rebased to the blob's offsets.
pub struct TextSection {
    pub bytes: Vec<u8>,
    pub symbols: Vec<ObjectSymbol>,
    pub relocations: Vec<PlacedRelocation>,
}

/// A relocation rebased against the final `.text` blob offset, still
/// targeting a symbol by name (resolved to a symbol-table index by each
/// writer at emission time).
pub struct PlacedRelocation {
    pub offset: u32,
    pub symbol: String,
    pub kind: RelocationKind,
    pub addend: i64,
}

/// Concatenate each function's encoded bytes into one `.text` blob,
/// rebasing every relocation and recording a symbol for every function
/// (defined here) plus every distinct call target not itself defined
/// here (extern).
pub fn build_text_section(functions: &[(String, EncodedFunction)]) -> TextSection {
    let mut bytes = Vec::new();
    let mut symbols = Vec::new();
    let mut relocations = Vec::new();
    let defined: std::collections::HashSet<&str> =
        functions.iter().map(|(name, _)| name.as_str()).collect();
    let mut externs_seen = std::collections::HashSet::new();

    for (name, encoded) in functions {
        let base = bytes.len() as u32;
        symbols.push(ObjectSymbol {
            name: name.clone(),
            offset: base,
            size: encoded.bytes.len() as u32,
            is_function: true,
            is_extern: false,
        });
        for reloc in &encoded.relocations {
            relocations.push(PlacedRelocation {
                offset: base + reloc.offset,
                symbol: reloc.symbol.clone(),
                kind: reloc.kind,
                addend: reloc.addend,
            });
            if !defined.contains(reloc.symbol.as_str()) && externs_seen.insert(reloc.symbol.clone()) {
                symbols.push(ObjectSymbol {
                    name: reloc.symbol.clone(),
                    offset: 0,
                    size: 0,
                    is_function: true,
                    is_extern: true,
                });
            }
        }
        bytes.extend_from_slice(&encoded.bytes);
    }

    TextSection { bytes, symbols, relocations }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::encode::Encoder;

    fn leaf_function(name: &str) -> (String, EncodedFunction) {
        let mut enc = Encoder::new();
        enc.mov_reg_imm32(crate::codegen::encode::Reg::Rax, 0);
        enc.ret();
        (name.to_string(), enc.finish().unwrap())
    }

    #[test]
    fn concatenates_functions_in_order_with_correct_offsets() {
        let funcs = vec![leaf_function("a"), leaf_function("b")];
        let section = build_text_section(&funcs);
        assert_eq!(section.symbols[0].offset, 0);
        assert_eq!(section.symbols[1].offset, funcs[0].1.bytes.len() as u32);
    }

    #[test]
    fn call_to_undefined_symbol_gets_one_extern_entry() {
        let mut enc = Encoder::new();
        enc.call_symbol("puts");
        enc.ret();
        let f = ("main".to_string(), enc.finish().unwrap());
        let section = build_text_section(std::slice::from_ref(&f));
        let externs: Vec<_> = section.symbols.iter().filter(|s| s.is_extern).collect();
        assert_eq!(externs.len(), 1);
        assert_eq!(externs[0].name, "puts");
    }

    #[test]
    fn relocation_offset_is_rebased_to_blob_position() {
        let funcs = vec![leaf_function("a"), {
            let mut enc = Encoder::new();
            enc.call_symbol("a");
            enc.ret();
            ("b".to_string(), enc.finish().unwrap())
        }];
        let a_len = funcs[0].1.bytes.len() as u32;
        let section = build_text_section(&funcs);
        let reloc = section.relocations.iter().find(|r| r.symbol == "a").unwrap();
        assert_eq!(reloc.offset, a_len + 1);
    }
}
