//! Linked PE executable writer.
//!
//! Minimal but structurally real: a 64-byte DOS stub ending in the
//! mandatory `e_lfanew` pointer, the PE signature, `IMAGE_FILE_HEADER`,
//! `IMAGE_OPTIONAL_HEADER64`, a `.text` section, and (when the program
//! calls any `extern` symbol) a second `.idata` section carrying a
//! single-DLL import table: one `IMAGE_IMPORT_DESCRIPTOR` for
//! `msvcrt.dll`, an Import Lookup/Address Table pair with one Hint/Name
//! entry per distinct extern, and one `jmp [rip+disp]` thunk per extern
//! appended to `.text`. A statically-linked program (no externs) carries
//! no `.idata` and no data directories at all.

use fixc_core::ByteBuffer;

use super::{patch_relocation, PendingExtern, BASE_ADDRESS};
use crate::error::CompileError;
use crate::object::TextSection;

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
const PE32_PLUS_MAGIC: u16 = 0x020B;
const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;
const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;
const NUMBER_OF_DATA_DIRECTORIES: u32 = 16;
const THUNK_SIZE: u32 = 6; // ff 25 <rel32>
const IMPORT_DLL: &str = "msvcrt.dll";

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

/// Virtual address `.text` is mapped at, relative to `BASE_ADDRESS`:
/// one section alignment unit in, after the headers. Shared by both the
/// static and import-table layouts since `.text` is always the first
/// section.
pub fn text_vaddr() -> u64 {
    BASE_ADDRESS + SECTION_ALIGNMENT as u64
}

/// Write a runnable PE32+ executable. `section` must already have had
/// `linker::link` run on it against `text_vaddr()`.
pub fn write_executable(section: &TextSection, entry: u64, pending_externs: &[PendingExtern]) -> Result<Vec<u8>, CompileError> {
    if pending_externs.is_empty() {
        Ok(write_without_imports(section, entry))
    } else {
        write_with_imports(section, entry, pending_externs)
    }
}

fn write_without_imports(section: &TextSection, entry: u64) -> Vec<u8> {
    let dos_stub_size = 64u32;
    let mut out = ByteBuffer::new();

    out.bytes(b"MZ");
    out.bytes(&[0u8; 0x3A]);
    out.u32(dos_stub_size);
    debug_assert_eq!(out.len() as u32, dos_stub_size);

    let pe_header_off = out.len() as u32;
    out.u32(IMAGE_NT_SIGNATURE);
    out.u16(IMAGE_FILE_MACHINE_AMD64);
    out.u16(1); // NumberOfSections
    out.u32(0);
    out.u32(0);
    out.u32(0);
    out.u16(112);
    out.u16(IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_LARGE_ADDRESS_AWARE);

    let text_size_raw = align_up(section.bytes.len() as u32, FILE_ALIGNMENT);
    let text_size_virtual = align_up(section.bytes.len().max(1) as u32, SECTION_ALIGNMENT);
    let headers_size = align_up(pe_header_off + 4 + 20 + 112 + 40, FILE_ALIGNMENT);

    out.u16(PE32_PLUS_MAGIC);
    out.u8(0);
    out.u8(0);
    out.u32(text_size_raw);
    out.u32(0);
    out.u32(0);
    out.u32((entry - BASE_ADDRESS) as u32);
    out.u32((text_vaddr() - BASE_ADDRESS) as u32);
    out.u64(BASE_ADDRESS);
    out.u32(SECTION_ALIGNMENT);
    out.u32(FILE_ALIGNMENT);
    out.u16(6);
    out.u16(0);
    out.u16(0);
    out.u16(0);
    out.u16(6);
    out.u16(0);
    out.u32(0);
    out.u32(headers_size + text_size_virtual);
    out.u32(headers_size);
    out.u32(0);
    out.u16(IMAGE_SUBSYSTEM_WINDOWS_CUI);
    out.u16(0);
    out.u64(0x10_0000);
    out.u64(0x1000);
    out.u64(0x10_0000);
    out.u64(0x1000);
    out.u32(0);
    out.u32(0); // NumberOfRvaAndSizes: no data directories (no imports, no exports)

    let mut text_name = [0u8; 8];
    text_name[..5].copy_from_slice(b".text");
    out.bytes(&text_name);
    out.u32(text_size_virtual);
    out.u32((text_vaddr() - BASE_ADDRESS) as u32);
    out.u32(text_size_raw);
    out.u32(headers_size);
    out.u32(0);
    out.u32(0);
    out.u16(0);
    out.u16(0);
    out.u32(IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ);

    out.align_to(FILE_ALIGNMENT as usize);
    debug_assert_eq!(out.len() as u32, headers_size);
    out.bytes(&section.bytes);
    out.align_to(FILE_ALIGNMENT as usize);

    out.into_vec()
}

fn write_with_imports(section: &TextSection, entry: u64, pending_externs: &[PendingExtern]) -> Result<Vec<u8>, CompileError> {
    let mut distinct: Vec<&str> = Vec::new();
    for pe in pending_externs {
        if !distinct.contains(&pe.symbol.as_str()) {
            distinct.push(&pe.symbol);
        }
    }
    let n = distinct.len() as u32;

    let dos_stub_size = 64u32;
    let pe_header_off = dos_stub_size;
    let headers_size = align_up(pe_header_off + 4 + 20 + 112 + NUMBER_OF_DATA_DIRECTORIES * 8 + 2 * 40, FILE_ALIGNMENT);

    // .text: original code, thunks appended, one per distinct extern.
    let text_vaddr = (text_vaddr() - BASE_ADDRESS) as u32;
    let text_raw_len = section.bytes.len() as u32 + n * THUNK_SIZE;
    let text_size_raw = align_up(text_raw_len, FILE_ALIGNMENT);
    let text_size_virtual = align_up(text_raw_len.max(1), SECTION_ALIGNMENT);

    let idata_vaddr = align_up(text_vaddr + text_size_virtual, SECTION_ALIGNMENT);

    // .idata layout, all RVAs relative to idata_vaddr:
    //   IMAGE_IMPORT_DESCRIPTOR[2] (one DLL + a null terminator)
    //   IAT[n+1]  (filled in by the loader; also what the thunks jump through)
    //   ILT[n+1]  (hint/name RVAs, loader-read-only copy of the IAT's initial contents)
    //   Hint/Name entries, one per import, then the DLL name string.
    let descriptor_table_off = 0u32;
    let descriptor_table_len = 2 * 20;
    let iat_off = descriptor_table_off + descriptor_table_len;
    let iat_len = (n + 1) * 8;
    let ilt_off = iat_off + iat_len;
    let ilt_len = (n + 1) * 8;
    let names_off = ilt_off + ilt_len;

    let mut names = ByteBuffer::new();
    let mut hint_name_rva = Vec::with_capacity(distinct.len());
    for name in &distinct {
        hint_name_rva.push(idata_vaddr + names_off + names.len() as u32);
        names.u16(0); // Hint
        names.cstr(name);
        names.align_to(2);
    }
    let dll_name_rva = idata_vaddr + names_off + names.len() as u32;
    names.cstr(IMPORT_DLL);
    let names_bytes = names.into_vec();

    let idata_raw_len = names_off + names_bytes.len() as u32;
    let idata_size_raw = align_up(idata_raw_len, FILE_ALIGNMENT);
    let idata_size_virtual = align_up(idata_raw_len.max(1), SECTION_ALIGNMENT);

    let iat_rva = idata_vaddr + iat_off;
    let thunk_rva = |i: u32| text_vaddr + section.bytes.len() as u32 + i * THUNK_SIZE;

    let mut text_bytes = section.bytes.clone();
    for pe in pending_externs {
        let i = distinct.iter().position(|s| *s == pe.symbol.as_str()).unwrap() as u32;
        let thunk_target = BASE_ADDRESS + thunk_rva(i) as u64;
        patch_relocation(&mut text_bytes, pe.offset, pe.kind, pe.addend, thunk_target, text_vaddr as u64 + BASE_ADDRESS)?;
    }
    for i in 0..n {
        let target_iat_entry_rva = iat_rva + i * 8;
        let rip_after_insn = BASE_ADDRESS + thunk_rva(i) as u64 + THUNK_SIZE as u64;
        let rel32 = (BASE_ADDRESS + target_iat_entry_rva as u64) as i64 - rip_after_insn as i64;
        text_bytes.push(0xFF);
        text_bytes.push(0x25);
        text_bytes.extend_from_slice(&(rel32 as i32).to_le_bytes());
    }

    let mut out = ByteBuffer::new();
    out.bytes(b"MZ");
    out.bytes(&[0u8; 0x3A]);
    out.u32(dos_stub_size);
    debug_assert_eq!(out.len() as u32, dos_stub_size);

    out.u32(IMAGE_NT_SIGNATURE);
    out.u16(IMAGE_FILE_MACHINE_AMD64);
    out.u16(2); // NumberOfSections: .text, .idata
    out.u32(0);
    out.u32(0);
    out.u32(0);
    out.u16((112 + NUMBER_OF_DATA_DIRECTORIES * 8) as u16);
    out.u16(IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_LARGE_ADDRESS_AWARE);

    out.u16(PE32_PLUS_MAGIC);
    out.u8(0);
    out.u8(0);
    out.u32(text_size_raw);
    out.u32(idata_size_raw);
    out.u32(0);
    out.u32((entry - BASE_ADDRESS) as u32);
    out.u32(text_vaddr);
    out.u64(BASE_ADDRESS);
    out.u32(SECTION_ALIGNMENT);
    out.u32(FILE_ALIGNMENT);
    out.u16(6);
    out.u16(0);
    out.u16(0);
    out.u16(0);
    out.u16(6);
    out.u16(0);
    out.u32(0);
    out.u32(idata_vaddr + idata_size_virtual);
    out.u32(headers_size);
    out.u32(0);
    out.u16(IMAGE_SUBSYSTEM_WINDOWS_CUI);
    out.u16(0);
    out.u64(0x10_0000);
    out.u64(0x1000);
    out.u64(0x10_0000);
    out.u64(0x1000);
    out.u32(0);
    out.u32(NUMBER_OF_DATA_DIRECTORIES);

    // DataDirectory[0]: Export Table (unused)
    out.u32(0);
    out.u32(0);
    // DataDirectory[1]: Import Table
    out.u32(idata_vaddr);
    out.u32(descriptor_table_len);
    // DataDirectory[2..11]: unused
    for _ in 2..12 {
        out.u32(0);
        out.u32(0);
    }
    // DataDirectory[12]: IAT
    out.u32(idata_vaddr + iat_off);
    out.u32(iat_len);
    // DataDirectory[13..16]: unused
    for _ in 13..NUMBER_OF_DATA_DIRECTORIES {
        out.u32(0);
        out.u32(0);
    }

    let mut text_name = [0u8; 8];
    text_name[..5].copy_from_slice(b".text");
    out.bytes(&text_name);
    out.u32(text_size_virtual);
    out.u32(text_vaddr);
    out.u32(text_size_raw);
    out.u32(headers_size);
    out.u32(0);
    out.u32(0);
    out.u16(0);
    out.u16(0);
    out.u32(IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ);

    let mut idata_name = [0u8; 8];
    idata_name[..6].copy_from_slice(b".idata");
    out.bytes(&idata_name);
    out.u32(idata_size_virtual);
    out.u32(idata_vaddr);
    out.u32(idata_size_raw);
    out.u32(headers_size + text_size_raw);
    out.u32(0);
    out.u32(0);
    out.u16(0);
    out.u16(0);
    out.u32(IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE);

    out.align_to(FILE_ALIGNMENT as usize);
    debug_assert_eq!(out.len() as u32, headers_size);
    out.bytes(&text_bytes);
    out.align_to(FILE_ALIGNMENT as usize);
    debug_assert_eq!(out.len() as u32, headers_size + text_size_raw);

    let idata_start = out.len();
    // IMAGE_IMPORT_DESCRIPTOR for msvcrt.dll.
    out.u32(idata_vaddr + ilt_off); // OriginalFirstThunk
    out.u32(0); // TimeDateStamp
    out.u32(0); // ForwarderChain
    out.u32(dll_name_rva); // Name
    out.u32(idata_vaddr + iat_off); // FirstThunk
    // Null terminator descriptor.
    out.bytes(&[0u8; 20]);

    for &rva in &hint_name_rva {
        out.u64(rva as u64);
    }
    out.u64(0); // IAT null terminator
    for &rva in &hint_name_rva {
        out.u64(rva as u64);
    }
    out.u64(0); // ILT null terminator

    out.bytes(&names_bytes);
    debug_assert_eq!(out.len() - idata_start, idata_raw_len as usize);
    out.align_to(FILE_ALIGNMENT as usize);

    Ok(out.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::encode::Encoder;
    use crate::linker::{entry_point, link};
    use crate::object::build_text_section;

    #[test]
    fn starts_with_mz_and_carries_pe_signature_at_e_lfanew() {
        let mut main = Encoder::new();
        main.ret();
        let mut section = build_text_section(&[("main".to_string(), main.finish().unwrap())]);
        let code_base = text_vaddr();
        let outcome = link(&mut section, code_base).unwrap();
        let entry = entry_point(&section, code_base).unwrap();
        let bytes = write_executable(&section, entry, &outcome.pending_externs).unwrap();
        assert_eq!(&bytes[0..2], b"MZ");
        let e_lfanew = u32::from_le_bytes(bytes[0x3C..0x40].try_into().unwrap()) as usize;
        assert_eq!(&bytes[e_lfanew..e_lfanew + 4], b"PE\0\0");
    }

    #[test]
    fn machine_is_amd64_in_file_header() {
        let mut main = Encoder::new();
        main.ret();
        let mut section = build_text_section(&[("main".to_string(), main.finish().unwrap())]);
        let code_base = text_vaddr();
        let outcome = link(&mut section, code_base).unwrap();
        let entry = entry_point(&section, code_base).unwrap();
        let bytes = write_executable(&section, entry, &outcome.pending_externs).unwrap();
        let e_lfanew = u32::from_le_bytes(bytes[0x3C..0x40].try_into().unwrap()) as usize;
        let machine_off = e_lfanew + 4;
        let machine = u16::from_le_bytes(bytes[machine_off..machine_off + 2].try_into().unwrap());
        assert_eq!(machine, IMAGE_FILE_MACHINE_AMD64);
    }

    #[test]
    fn call_to_extern_symbol_adds_an_idata_section_with_nonzero_import_directory() {
        let mut main = Encoder::new();
        main.call_symbol("printf");
        main.mov_reg_imm32(crate::codegen::encode::Reg::Rax, 0);
        main.ret();
        let mut section = build_text_section(&[("main".to_string(), main.finish().unwrap())]);
        let code_base = text_vaddr();
        let outcome = link(&mut section, code_base).unwrap();
        assert_eq!(outcome.pending_externs.len(), 1);
        let entry = entry_point(&section, code_base).unwrap();
        let bytes = write_executable(&section, entry, &outcome.pending_externs).unwrap();
        let e_lfanew = u32::from_le_bytes(bytes[0x3C..0x40].try_into().unwrap()) as usize;
        let number_of_sections_off = e_lfanew + 4 + 2;
        let number_of_sections = u16::from_le_bytes(bytes[number_of_sections_off..number_of_sections_off + 2].try_into().unwrap());
        assert_eq!(number_of_sections, 2);
        let opt_header_off = e_lfanew + 4 + 20;
        let import_dir_off = opt_header_off + 112 + 8; // DataDirectory[1] = Import Table
        let import_dir_rva = u32::from_le_bytes(bytes[import_dir_off..import_dir_off + 4].try_into().unwrap());
        assert_ne!(import_dir_rva, 0);
    }
}
