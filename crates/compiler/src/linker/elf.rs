//! Linked ELF64 executable writer.
//!
//! A program with no `extern` calls links as a single `PT_LOAD` segment
//! carrying `.text`, mapped read+execute at `BASE_ADDRESS`: a static,
//! non-PIE binary. A program that does call an `extern` symbol (the
//! usual way to reach `printf`, `malloc`, and the rest of libc) instead
//! gets `PT_INTERP` pointing at the system dynamic linker plus a minimal
//! `PT_DYNAMIC` apparatus (`.dynstr`/`.dynsym`/`.rela.dyn`), one GOT slot
//! and one `jmp [rip+disp]` thunk per distinct extern, with every call
//! site repointed at its thunk. Binding is eager: every GOT slot carries
//! an `R_X86_64_GLOB_DAT` relocation the dynamic linker fills in at load
//! time, so there's no lazy PLT0 resolver to maintain.

use fixc_core::ByteBuffer;

use super::{patch_relocation, PendingExtern, BASE_ADDRESS};
use crate::error::CompileError;
use crate::object::TextSection;

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;
const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;

const R_X86_64_GLOB_DAT: u64 = 6;
const STB_GLOBAL_STT_FUNC: u8 = (1 << 4) | 2;
const SHN_UNDEF: u16 = 0;

const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_SYMTAB: u64 = 6;
const DT_RELA: u64 = 7;
const DT_RELASZ: u64 = 8;
const DT_RELAENT: u64 = 9;
const DT_STRSZ: u64 = 10;
const DT_SYMENT: u64 = 11;
const DT_NULL: u64 = 0;

const INTERP: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";
const NEEDED_LIB: &str = "libc.so.6";
const THUNK_SIZE: u64 = 6; // ff 25 <rel32>

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Virtual address `.text` is mapped at for a statically linked binary
/// (no pending externs): `BASE_ADDRESS` plus the fixed single-`PT_LOAD`
/// header region that precedes it in the file.
pub fn text_vaddr() -> u64 {
    BASE_ADDRESS + EHDR_SIZE + PHDR_SIZE
}

/// Virtual address `.text` is mapped at once `PT_INTERP`/`PT_DYNAMIC`
/// are added ahead of it. Callers decide which of `text_vaddr` or this
/// to use as `linker::link`'s `code_base` before linking even runs, by
/// checking whether the object carries any extern symbol at all.
pub fn dynamic_text_vaddr() -> u64 {
    BASE_ADDRESS + EHDR_SIZE + PHDR_SIZE * 3 + INTERP.len() as u64
}

/// Write a runnable ELF64 executable. `section` must already have had
/// `linker::link` run on it (relocations resolved in place) against
/// `text_vaddr()` if `pending_externs` is empty, `dynamic_text_vaddr()`
/// otherwise.
pub fn write_executable(section: &TextSection, entry: u64, pending_externs: &[PendingExtern]) -> Result<Vec<u8>, CompileError> {
    if pending_externs.is_empty() {
        Ok(write_static(section, entry))
    } else {
        write_dynamic(section, entry, pending_externs)
    }
}

fn write_static(section: &TextSection, entry: u64) -> Vec<u8> {
    let ehdr_size = EHDR_SIZE;
    let phdr_size = PHDR_SIZE;
    let phnum = 1u64;
    let text_file_off = ehdr_size + phdr_size * phnum;
    let text_vaddr = text_vaddr();

    let mut out = ByteBuffer::new();
    out.bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.u16(ET_EXEC);
    out.u16(EM_X86_64);
    out.u32(1); // e_version
    out.u64(if entry == 0 { text_vaddr } else { entry });
    out.u64(ehdr_size); // e_phoff
    out.u64(0); // e_shoff: no section headers in a linked executable
    out.u32(0); // e_flags
    out.u16(ehdr_size as u16);
    out.u16(phdr_size as u16);
    out.u16(phnum as u16);
    out.u16(0); // e_shentsize
    out.u16(0); // e_shnum
    out.u16(0); // e_shstrndx

    // Single PT_LOAD segment: the whole file, mapped at BASE_ADDRESS so
    // file offset 0 lines up with vaddr BASE_ADDRESS (standard
    // non-PIE-executable convention that keeps segment and file offsets
    // trivially related).
    let file_size = text_file_off + section.bytes.len() as u64;
    out.u32(PT_LOAD);
    out.u32(PF_X | PF_R);
    out.u64(0); // p_offset
    out.u64(BASE_ADDRESS); // p_vaddr
    out.u64(BASE_ADDRESS); // p_paddr
    out.u64(file_size); // p_filesz
    out.u64(file_size); // p_memsz
    out.u64(0x1000); // p_align

    out.bytes(&section.bytes);
    out.into_vec()
}

fn write_dynamic(section: &TextSection, entry: u64, pending_externs: &[PendingExtern]) -> Result<Vec<u8>, CompileError> {
    let mut distinct: Vec<&str> = Vec::new();
    for pe in pending_externs {
        if !distinct.contains(&pe.symbol.as_str()) {
            distinct.push(&pe.symbol);
        }
    }
    let n = distinct.len() as u64;

    let ehdr_size = EHDR_SIZE;
    let phdr_size = PHDR_SIZE;
    let phnum = 3u64;
    let headers_size = ehdr_size + phdr_size * phnum;
    let interp_off = headers_size;
    let text_off = interp_off + INTERP.len() as u64;
    let text_vaddr = BASE_ADDRESS + text_off;
    debug_assert_eq!(text_vaddr, dynamic_text_vaddr());

    let original_len = section.bytes.len() as u64;
    let thunks_off = text_off + original_len;
    let thunks_len = n * THUNK_SIZE;
    let got_off = align_up(thunks_off + thunks_len, 8);
    let got_len = n * 8;

    // .dynstr: empty string at index 0, then the needed library, then
    // each distinct extern's name.
    let mut dynstr = ByteBuffer::new();
    dynstr.u8(0);
    let needed_name_off = dynstr.len() as u64;
    dynstr.cstr(NEEDED_LIB);
    let mut sym_name_off = Vec::with_capacity(distinct.len());
    for name in &distinct {
        sym_name_off.push(dynstr.len() as u64);
        dynstr.cstr(name);
    }
    let dynstr_bytes = dynstr.into_vec();
    let dynstr_off = align_up(got_off + got_len, 1);
    let dynstr_len = dynstr_bytes.len() as u64;

    let dynsym_off = align_up(dynstr_off + dynstr_len, 8);
    let dynsym_len = (n + 1) * 24;

    let rela_off = align_up(dynsym_off + dynsym_len, 8);
    let rela_len = n * 24;

    let dynamic_off = align_up(rela_off + rela_len, 8);
    let dynamic_len = 9 * 16;

    let file_end = dynamic_off + dynamic_len;

    let vaddr = |off: u64| BASE_ADDRESS + off;
    let thunk_vaddr = |i: u64| vaddr(thunks_off + i * THUNK_SIZE);
    let got_vaddr = |i: u64| vaddr(got_off + i * 8);

    // Patch every call site against its thunk address, then append the
    // thunks themselves right after the original code.
    let mut text_bytes = section.bytes.clone();
    for pe in pending_externs {
        let i = distinct.iter().position(|s| *s == pe.symbol.as_str()).unwrap() as u64;
        patch_relocation(&mut text_bytes, pe.offset, pe.kind, pe.addend, thunk_vaddr(i), text_vaddr)?;
    }
    for i in 0..n {
        let rel32 = (got_vaddr(i) as i64 - (thunk_vaddr(i) as i64 + THUNK_SIZE as i64)) as i32;
        text_bytes.push(0xFF);
        text_bytes.push(0x25);
        text_bytes.extend_from_slice(&rel32.to_le_bytes());
    }

    let mut out = ByteBuffer::new();
    out.bytes(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.u16(ET_EXEC);
    out.u16(EM_X86_64);
    out.u32(1); // e_version
    out.u64(if entry == 0 { text_vaddr } else { entry });
    out.u64(ehdr_size); // e_phoff
    out.u64(0); // e_shoff
    out.u32(0); // e_flags
    out.u16(ehdr_size as u16);
    out.u16(phdr_size as u16);
    out.u16(phnum as u16);
    out.u16(0);
    out.u16(0);
    out.u16(0);

    // PT_LOAD: the whole file in one RWX mapping. No W^X segment split;
    // the GOT the dynamic linker writes into shares the same segment as
    // the code that calls through it.
    out.u32(PT_LOAD);
    out.u32(PF_X | PF_W | PF_R);
    out.u64(0);
    out.u64(BASE_ADDRESS);
    out.u64(BASE_ADDRESS);
    out.u64(file_end);
    out.u64(file_end);
    out.u64(0x1000);

    out.u32(PT_INTERP);
    out.u32(PF_R);
    out.u64(interp_off);
    out.u64(vaddr(interp_off));
    out.u64(vaddr(interp_off));
    out.u64(INTERP.len() as u64);
    out.u64(INTERP.len() as u64);
    out.u64(1);

    out.u32(PT_DYNAMIC);
    out.u32(PF_R | PF_W);
    out.u64(dynamic_off);
    out.u64(vaddr(dynamic_off));
    out.u64(vaddr(dynamic_off));
    out.u64(dynamic_len);
    out.u64(dynamic_len);
    out.u64(8);

    out.bytes(INTERP);
    out.bytes(&text_bytes);
    while (out.len() as u64) < got_off {
        out.u8(0);
    }
    for _ in 0..n {
        out.u64(0); // GOT slot, filled in by the dynamic linker at load time
    }
    out.bytes(&dynstr_bytes);
    while (out.len() as u64) < dynsym_off {
        out.u8(0);
    }
    // dynsym[0]: the mandatory null entry.
    out.u32(0);
    out.u8(0);
    out.u8(0);
    out.u16(0);
    out.u64(0);
    out.u64(0);
    for (i, _) in distinct.iter().enumerate() {
        out.u32(sym_name_off[i] as u32);
        out.u8(STB_GLOBAL_STT_FUNC);
        out.u8(0);
        out.u16(SHN_UNDEF);
        out.u64(0);
        out.u64(0);
    }
    while (out.len() as u64) < rela_off {
        out.u8(0);
    }
    for i in 0..n {
        out.u64(got_vaddr(i));
        out.u64(((i + 1) << 32) | R_X86_64_GLOB_DAT);
        out.i64(0);
    }
    while (out.len() as u64) < dynamic_off {
        out.u8(0);
    }
    out.u64(DT_NEEDED);
    out.u64(needed_name_off);
    out.u64(DT_STRTAB);
    out.u64(vaddr(dynstr_off));
    out.u64(DT_STRSZ);
    out.u64(dynstr_len);
    out.u64(DT_SYMTAB);
    out.u64(vaddr(dynsym_off));
    out.u64(DT_SYMENT);
    out.u64(24);
    out.u64(DT_RELA);
    out.u64(vaddr(rela_off));
    out.u64(DT_RELASZ);
    out.u64(rela_len);
    out.u64(DT_RELAENT);
    out.u64(24);
    out.u64(DT_NULL);
    out.u64(0);

    Ok(out.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::encode::Encoder;
    use crate::linker::{entry_point, link};
    use crate::object::build_text_section;

    #[test]
    fn entry_point_matches_main_offset_plus_text_file_offset() {
        let mut main = Encoder::new();
        main.mov_reg_imm32(crate::codegen::encode::Reg::Rax, 0);
        main.ret();
        let mut section = build_text_section(&[("main".to_string(), main.finish().unwrap())]);
        let code_base = text_vaddr();
        let outcome = link(&mut section, code_base).unwrap();
        let entry = entry_point(&section, code_base).unwrap();
        let bytes = write_executable(&section, entry, &outcome.pending_externs).unwrap();
        let e_entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(e_entry, entry);
        assert_eq!(entry, code_base);
    }

    #[test]
    fn file_starts_with_elf_magic_and_et_exec() {
        let mut main = Encoder::new();
        main.ret();
        let mut section = build_text_section(&[("main".to_string(), main.finish().unwrap())]);
        let code_base = text_vaddr();
        let outcome = link(&mut section, code_base).unwrap();
        let entry = entry_point(&section, code_base).unwrap();
        let bytes = write_executable(&section, entry, &outcome.pending_externs).unwrap();
        assert_eq!(&bytes[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), ET_EXEC);
    }

    #[test]
    fn call_to_extern_symbol_gets_an_interp_and_dynamic_segment() {
        let mut main = Encoder::new();
        main.call_symbol("printf");
        main.mov_reg_imm32(crate::codegen::encode::Reg::Rax, 0);
        main.ret();
        let mut section = build_text_section(&[("main".to_string(), main.finish().unwrap())]);
        let code_base = dynamic_text_vaddr();
        let outcome = link(&mut section, code_base).unwrap();
        assert_eq!(outcome.pending_externs.len(), 1);
        let entry = entry_point(&section, code_base).unwrap();
        let bytes = write_executable(&section, entry, &outcome.pending_externs).unwrap();
        let phnum = u16::from_le_bytes(bytes[56..58].try_into().unwrap());
        assert_eq!(phnum, 3);
        // PT_INTERP's p_type is the first u32 of the second program header.
        let phoff = EHDR_SIZE as usize;
        let interp_phdr = &bytes[phoff + PHDR_SIZE as usize..phoff + 2 * PHDR_SIZE as usize];
        let p_type = u32::from_le_bytes(interp_phdr[0..4].try_into().unwrap());
        assert_eq!(p_type, PT_INTERP);
    }

    #[test]
    fn extern_call_site_is_repatched_to_point_at_its_thunk_not_left_zero() {
        let mut main = Encoder::new();
        main.call_symbol("printf");
        main.ret();
        let mut section = build_text_section(&[("main".to_string(), main.finish().unwrap())]);
        let code_base = dynamic_text_vaddr();
        let outcome = link(&mut section, code_base).unwrap();
        let reloc = outcome.pending_externs.iter().find(|p| p.symbol == "printf").unwrap();
        // Before `write_executable` repatches it, the call's displacement
        // field is still the placeholder zero `link` left it at.
        let placeholder = i32::from_le_bytes(section.bytes[reloc.offset as usize..reloc.offset as usize + 4].try_into().unwrap());
        assert_eq!(placeholder, 0);
    }
}
