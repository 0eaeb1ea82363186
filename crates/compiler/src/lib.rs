//! fixc: a self-hosting compiler for a pragmatic C subset, targeting
//! x86-64 PE/COFF and ELF.
//!
//! The pipeline is linear: preprocess, parse into a typed AST, then hand
//! the AST to exactly one of the three back-end stages selected by
//! `CompilerConfig::emit`. Every stage is instrumented with a `tracing`
//! span so the pipeline can be traced stage-by-stage.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod error;
pub mod lexer;
pub mod linker;
pub mod object;
pub mod parser;
pub mod preprocessor;
pub mod token;
pub mod types;

use std::path::Path;

use config::{CompilerConfig, EmitKind};
use error::CompileError;
use fixc_core::{Os, Target};
use parser::Parser;
use preprocessor::Preprocessor;
use tracing::{info, instrument};

/// What `compile_file_with_config` actually produced, so callers (the
/// CLI, or a test harness) can decide how to write it out without the
/// library dictating a file extension.
pub enum CompileOutput {
    Assembly(String),
    Object(Vec<u8>),
    Executable(Vec<u8>),
}

/// Run the full pipeline (preprocess, parse, generate) over one
/// translation unit. Multi-file projects are out of scope; `resolve_include` within
/// `preprocessor.rs` still lets that one file pull in headers.
#[instrument(skip(source, config), fields(file = %file.display()))]
pub fn compile_file_with_config(file: &Path, source: &str, config: &CompilerConfig) -> Result<CompileOutput, CompileError> {
    let preprocessed = preprocess(file, source, config)?;
    let program = parse(file, &preprocessed, config)?;
    generate(&program.0, &program.1, config)
}

#[instrument(skip(source, config), fields(file = %file.display()))]
fn preprocess(file: &Path, source: &str, config: &CompilerConfig) -> Result<String, CompileError> {
    let mut pp = Preprocessor::new(config);
    let out = pp.preprocess(file, source)?;
    info!(bytes = out.len(), "preprocessed");
    Ok(out)
}

#[instrument(skip(source, config), fields(file = %file.display()))]
fn parse(file: &Path, source: &str, config: &CompilerConfig) -> Result<(ast::Program, types::TypeTable), CompileError> {
    let file_name = file.display().to_string();
    let mut parser = Parser::new(file_name, source, config.target);
    let program = parser.parse()?;
    info!(
        functions = program.functions.len(),
        globals = program.globals.len(),
        "parsed"
    );
    Ok((program, parser.types))
}

#[instrument(skip(program, types, config))]
fn generate(program: &ast::Program, types: &types::TypeTable, config: &CompilerConfig) -> Result<CompileOutput, CompileError> {
    match config.emit {
        EmitKind::Asm => {
            let asm = codegen::emit_assembly(program, types, config)?;
            Ok(CompileOutput::Assembly(asm))
        }
        EmitKind::Object => {
            let functions = codegen::emit_object(program, types, config)?;
            let section = object::build_text_section(
                &functions.into_iter().map(|f| (f.name, f.code)).collect::<Vec<_>>(),
            );
            let bytes = match config.target.os {
                Os::Windows => object::coff::write_object(&section),
                Os::Linux | Os::Dos16 => object::elf::write_object(&section),
            };
            Ok(CompileOutput::Object(bytes))
        }
        EmitKind::Executable => {
            let functions = codegen::emit_object(program, types, config)?;
            let mut section = object::build_text_section(
                &functions.into_iter().map(|f| (f.name, f.code)).collect::<Vec<_>>(),
            );
            // Whether any call in this translation unit targets an
            // `extern` symbol decides which fixed load address the
            // section's relocations get resolved against: the plain
            // single-segment layout, or the one that leaves room for the
            // import apparatus ahead of `.text`. This has to be settled
            // before `linker::link` runs, since `link` needs a `code_base`
            // up front.
            let has_imports = section.symbols.iter().any(|s| s.is_extern);
            let bytes = match config.target.os {
                Os::Windows => {
                    let code_base = linker::pe::text_vaddr();
                    let outcome = linker::link(&mut section, code_base)?;
                    let entry = linker::entry_point(&section, code_base)?;
                    linker::pe::write_executable(&section, entry, &outcome.pending_externs)?
                }
                Os::Linux | Os::Dos16 => {
                    let code_base = if has_imports { linker::elf::dynamic_text_vaddr() } else { linker::elf::text_vaddr() };
                    let outcome = linker::link(&mut section, code_base)?;
                    let entry = linker::entry_point(&section, code_base)?;
                    linker::elf::write_executable(&section, entry, &outcome.pending_externs)?
                }
            };
            Ok(CompileOutput::Executable(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn compiles_trivial_program_to_assembly() {
        let config = CompilerConfig::new(Target::linux64()).with_emit(EmitKind::Asm);
        let out = compile_file_with_config(&PathBuf::from("t.c"), "int main(void) { return 0; }", &config).unwrap();
        match out {
            CompileOutput::Assembly(text) => assert!(text.contains("main:")),
            _ => panic!("expected assembly output"),
        }
    }

    #[test]
    fn compiles_trivial_program_to_linux_executable() {
        let config = CompilerConfig::new(Target::linux64()).with_emit(EmitKind::Executable);
        let out = compile_file_with_config(&PathBuf::from("t.c"), "int main(void) { return 0; }", &config).unwrap();
        match out {
            CompileOutput::Executable(bytes) => assert_eq!(&bytes[0..4], &[0x7F, b'E', b'L', b'F']),
            _ => panic!("expected an ELF executable"),
        }
    }

    #[test]
    fn compiles_trivial_program_to_windows_object() {
        let config = CompilerConfig::new(Target::win64()).with_emit(EmitKind::Object);
        let out = compile_file_with_config(&PathBuf::from("t.c"), "int main(void) { return 0; }", &config).unwrap();
        match out {
            CompileOutput::Object(bytes) => assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 0x8664),
            _ => panic!("expected a COFF object"),
        }
    }

    #[test]
    fn undefined_call_target_fails_at_link_time_not_parse_time() {
        let config = CompilerConfig::new(Target::linux64()).with_emit(EmitKind::Executable);
        let result = compile_file_with_config(
            &PathBuf::from("t.c"),
            "int main(void) { return never_defined(); }",
            &config,
        );
        assert!(result.is_err());
    }

    #[test]
    fn linux_executable_calling_an_extern_libc_function_links_successfully() {
        let config = CompilerConfig::new(Target::linux64()).with_emit(EmitKind::Executable);
        let out = compile_file_with_config(
            &PathBuf::from("t.c"),
            "extern int printf(const char *fmt, ...); int main(void) { printf(\"hi\\n\"); return 0; }",
            &config,
        )
        .unwrap();
        match out {
            CompileOutput::Executable(bytes) => assert_eq!(&bytes[0..4], &[0x7F, b'E', b'L', b'F']),
            _ => panic!("expected an ELF executable"),
        }
    }

    #[test]
    fn windows_executable_calling_an_extern_libc_function_links_successfully() {
        let config = CompilerConfig::new(Target::win64()).with_emit(EmitKind::Executable);
        let out = compile_file_with_config(
            &PathBuf::from("t.c"),
            "extern int printf(const char *fmt, ...); int main(void) { printf(\"hi\\n\"); return 0; }",
            &config,
        )
        .unwrap();
        match out {
            CompileOutput::Executable(bytes) => assert_eq!(&bytes[0..2], b"MZ"),
            _ => panic!("expected a PE executable"),
        }
    }
}
