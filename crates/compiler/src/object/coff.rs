//! COFF relocatable object writer.
//!
//! A much smaller header than ELF: one `IMAGE_FILE_HEADER`, one section
//! table entry for `.text`, its relocation records, and a symbol/string
//! table pair. `IMAGE_REL_AMD64_REL32` is the COFF equivalent of ELF's
//! `R_X86_64_PC32`/`PLT32`: a 4-byte displacement relative to the byte
//! after the relocated field, which is exactly what
//! `codegen::encode::Encoder::call_symbol` already produces.

use fixc_core::ByteBuffer;

use super::TextSection;

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_REL_AMD64_REL32: u16 = 0x0004;
const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;
const IMAGE_SYM_UNDEFINED: i32 = 0;
const IMAGE_SYM_TYPE_FUNCTION: u16 = 0x20;

/// Write a minimal COFF object (`.obj`) with one `.text` section, its
/// `IMAGE_RELOCATION` table, and a symbol table naming every function
/// defined or called in `section`.
pub fn write_object(section: &TextSection) -> Vec<u8> {
    let mut text_name = [0u8; 8];
    text_name[..5].copy_from_slice(b".text");

    let mut relocations = ByteBuffer::new();
    for reloc in &section.relocations {
        let sym_index = section
            .symbols
            .iter()
            .position(|s| s.name == reloc.symbol)
            .unwrap_or(0) as u32;
        relocations.u32(reloc.offset).u32(sym_index).u16(IMAGE_REL_AMD64_REL32);
    }

    // COFF's long-name string table lives right after the symbol table;
    // names over 8 bytes get a `0, offset` encoding in the symbol record
    // instead of the inline 8-byte name (every name here is a C
    // identifier and can be long, so every symbol uses this form rather
    // than special-casing short names).
    let mut strtab = ByteBuffer::new();
    strtab.u32(0); // patched below once the total size is known
    let mut name_offsets = Vec::with_capacity(section.symbols.len());
    for sym in &section.symbols {
        name_offsets.push(strtab.len() as u32);
        strtab.cstr(&sym.name);
    }
    let strtab_size = strtab.len() as u32;
    strtab.patch_u32(0, strtab_size);

    let mut symtab = ByteBuffer::new();
    for (sym, &name_off) in section.symbols.iter().zip(&name_offsets) {
        symtab.u32(0); // zero first 4 bytes signals "name is in the string table"
        symtab.u32(name_off);
        symtab.u32(if sym.is_extern { IMAGE_SYM_UNDEFINED as u32 } else { sym.offset });
        symtab.i16(if sym.is_extern { 0 } else { 1 }); // section number (1 = .text), 0 = undefined
        symtab.u16(if sym.is_function { IMAGE_SYM_TYPE_FUNCTION } else { 0 });
        symtab.u8(IMAGE_SYM_CLASS_EXTERNAL);
        symtab.u8(0); // no auxiliary symbol records
    }

    let header_size = 20u32; // IMAGE_FILE_HEADER
    let section_header_size = 40u32;
    let text_off = header_size + section_header_size;
    let text_size = section.bytes.len() as u32;
    let reloc_off = text_off + text_size;
    let reloc_count = section.relocations.len() as u16;
    let symtab_off = reloc_off + relocations.len() as u32;
    let symtab_count = section.symbols.len() as u32;

    let mut out = ByteBuffer::new();
    // IMAGE_FILE_HEADER
    out.u16(IMAGE_FILE_MACHINE_AMD64);
    out.u16(1); // NumberOfSections
    out.u32(0); // TimeDateStamp: deterministic builds carry no build timestamp
    out.u32(symtab_off);
    out.u32(symtab_count);
    out.u16(0); // SizeOfOptionalHeader (none, this is an object file)
    out.u16(0); // Characteristics

    // IMAGE_SECTION_HEADER for .text
    out.bytes(&text_name);
    out.u32(0); // VirtualSize (unused in object files)
    out.u32(0); // VirtualAddress
    out.u32(text_size);
    out.u32(text_off);
    out.u32(reloc_off);
    out.u32(0); // PointerToLinenumbers
    out.u16(reloc_count);
    out.u16(0); // NumberOfLinenumbers
    out.u32(IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ);

    out.bytes(&section.bytes);
    out.bytes(relocations.as_slice());
    out.bytes(symtab.as_slice());
    out.bytes(strtab.as_slice());

    out.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::encode::Encoder;
    use crate::object::build_text_section;

    #[test]
    fn machine_field_is_amd64() {
        let mut enc = Encoder::new();
        enc.ret();
        let section = build_text_section(&[("f".to_string(), enc.finish().unwrap())]);
        let bytes = write_object(&section);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), IMAGE_FILE_MACHINE_AMD64);
    }

    #[test]
    fn one_relocation_per_call_site() {
        let mut enc = Encoder::new();
        enc.call_symbol("MessageBoxA");
        enc.ret();
        let section = build_text_section(&[("main".to_string(), enc.finish().unwrap())]);
        assert_eq!(section.relocations.len(), 1);
        let bytes = write_object(&section);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn string_table_starts_with_its_own_total_size() {
        let mut enc = Encoder::new();
        enc.ret();
        let name = "a_long_function_name";
        let section = build_text_section(&[(name.to_string(), enc.finish().unwrap())]);
        let bytes = write_object(&section);
        // header(20) + section header(40) + .text + relocations(0) + one 18-byte symbol record
        let strtab_off = 20 + 40 + section.bytes.len() + 18;
        let strtab_len_field = u32::from_le_bytes(bytes[strtab_off..strtab_off + 4].try_into().unwrap());
        assert_eq!(strtab_len_field as usize, 4 + name.len() + 1);
    }
}
