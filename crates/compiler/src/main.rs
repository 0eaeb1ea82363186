//! fixc CLI
//!
//! Command-line driver for compiling one C translation unit to assembly,
//! a relocatable object, or a linked executable.

use clap::Parser as ClapParser;
use fixc_compiler::config::{AsmSyntax, CompilerConfig, EmitKind};
use fixc_compiler::{compile_file_with_config, CompileOutput};
use fixc_core::Target;
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "fixc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A self-hosting C99-subset compiler for x86-64", long_about = None)]
struct Cli {
    /// Input .c source file
    source: PathBuf,

    /// Output file path (defaults to the source stem, extension per --emit)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Stop after assembly generation
    #[arg(short = 'S')]
    asm_only: bool,

    /// Emit a relocatable object, skip the link step
    #[arg(long = "obj")]
    obj_only: bool,

    /// Use Intel / MASM-compatible assembly syntax (default AT&T)
    #[arg(long)]
    masm: bool,

    /// Add an include-search directory
    #[arg(short = 'I', value_name = "DIR")]
    include_dirs: Vec<PathBuf>,

    /// Predefine a macro, optionally `NAME=value`
    #[arg(short = 'D', value_name = "NAME[=VAL]")]
    defines: Vec<String>,

    /// Optimization level: accepted for command-line compatibility, inert
    #[arg(short = 'O', value_name = "LEVEL", default_value = "0")]
    opt_level: String,

    /// Emit a debug line table alongside the chosen output
    #[arg(short = 'g')]
    debug_info: bool,

    /// Target triple: linux64 (default), win64, or dos16
    #[arg(long, default_value = "linux64")]
    target: String,

    /// Log verbosity: off, error, warn, info, debug, trace (falls back to RUST_LOG)
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let target = match cli.target.as_str() {
        "linux64" => Target::linux64(),
        "win64" => Target::win64(),
        "dos16" => Target::dos16(),
        other => {
            eprintln!("fixc: unknown target `{other}` (expected linux64, win64, or dos16)");
            process::exit(1);
        }
    };

    let emit = if cli.asm_only {
        EmitKind::Asm
    } else if cli.obj_only {
        EmitKind::Object
    } else {
        EmitKind::Executable
    };

    let mut config = CompilerConfig::new(target)
        .with_emit(emit)
        .with_debug_info(cli.debug_info);
    config.opt_level = cli.opt_level;
    if cli.masm {
        config = config.with_syntax(AsmSyntax::Intel);
    }
    for dir in &cli.include_dirs {
        config = config.with_include_dir(dir.clone());
    }
    for raw in &cli.defines {
        let (name, value) = match raw.split_once('=') {
            Some((n, v)) => (n.to_string(), Some(v.to_string())),
            None => (raw.clone(), None),
        };
        config = config.with_define(name, value);
    }

    let output_path = cli.output.clone().unwrap_or_else(|| default_output_path(&cli.source, emit));

    let source = match fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("fixc: {}: {}", cli.source.display(), e);
            process::exit(1);
        }
    };

    match compile_file_with_config(&cli.source, &source, &config) {
        Ok(output) => {
            if let Err(e) = write_output(&output_path, output) {
                eprintln!("fixc: {}: {}", output_path.display(), e);
                let _ = fs::remove_file(&output_path);
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            let _ = fs::remove_file(&output_path);
            process::exit(1);
        }
    }
}

fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_output_path(source: &std::path::Path, emit: EmitKind) -> PathBuf {
    let stem = source.file_stem().unwrap_or_default();
    match emit {
        EmitKind::Asm => PathBuf::from(stem).with_extension("s"),
        EmitKind::Object => PathBuf::from(stem).with_extension("o"),
        EmitKind::Executable => PathBuf::from(stem),
    }
}

fn write_output(path: &std::path::Path, output: CompileOutput) -> std::io::Result<()> {
    match output {
        CompileOutput::Assembly(text) => fs::write(path, text),
        CompileOutput::Object(bytes) => fs::write(path, bytes),
        CompileOutput::Executable(bytes) => {
            fs::write(path, &bytes)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(path)?.permissions();
                perms.set_mode(0o755);
                fs::set_permissions(path, perms)?;
            }
            Ok(())
        }
    }
}
