//! Compiler configuration.
//!
//! A plain struct with `with_*` builder methods rather than a
//! derive-heavy options struct, so the CLI and the library entry point
//! share one construction path.

use fixc_core::Target;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Requested output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmitKind {
    /// Textual assembly.
    Asm,
    /// Relocatable object (COFF or ELF64, per target).
    Object,
    /// Linked executable (PE or ELF).
    Executable,
}

/// Assembly syntax for `EmitKind::Asm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsmSyntax {
    AttT,
    Intel,
}

/// A subset of project settings that can be loaded from a `fixc.toml` file
/// alongside CLI flags, so `CompilerConfig` can be built either way. Only the pieces that make sense as
/// static project metadata are serializable; the include/define lists
/// built up from repeated `-I`/`-D` flags are appended after loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectManifest {
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub defines: Vec<(String, Option<String>)>,
}

impl ProjectManifest {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub target: Target,
    pub include_dirs: Vec<PathBuf>,
    pub defines: Vec<(String, Option<String>)>,
    pub emit: EmitKind,
    pub syntax: AsmSyntax,
    /// `-g`: emit a `.debug_fixc` comment section naming source file and
    /// line per instruction, rather than full DWARF.
    pub debug_info: bool,
    /// `-O0`..`-O3`/`-Os`/`-Og`: accepted and stored but otherwise
    /// inert.
    pub opt_level: String,
    pub output: Option<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            target: Target::default(),
            include_dirs: Vec::new(),
            defines: Vec::new(),
            emit: EmitKind::Executable,
            syntax: AsmSyntax::AttT,
            debug_info: false,
            opt_level: "0".to_string(),
            output: None,
        }
    }
}

impl CompilerConfig {
    pub fn new(target: Target) -> Self {
        CompilerConfig {
            target,
            ..Default::default()
        }
    }

    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn with_define(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.defines.push((name.into(), value));
        self
    }

    pub fn with_emit(mut self, emit: EmitKind) -> Self {
        self.emit = emit;
        self
    }

    pub fn with_syntax(mut self, syntax: AsmSyntax) -> Self {
        self.syntax = syntax;
        self
    }

    pub fn with_debug_info(mut self, debug_info: bool) -> Self {
        self.debug_info = debug_info;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn apply_manifest(mut self, manifest: ProjectManifest) -> Self {
        self.include_dirs.extend(manifest.include_dirs);
        self.defines.extend(manifest.defines);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_links_an_executable() {
        let config = CompilerConfig::default();
        assert_eq!(config.emit, EmitKind::Executable);
        assert_eq!(config.syntax, AsmSyntax::AttT);
    }

    #[test]
    fn builder_methods_accumulate() {
        let config = CompilerConfig::new(Target::win64())
            .with_include_dir("include")
            .with_define("DEBUG", Some("1".to_string()))
            .with_emit(EmitKind::Object);
        assert_eq!(config.include_dirs, vec![PathBuf::from("include")]);
        assert_eq!(config.defines, vec![("DEBUG".to_string(), Some("1".to_string()))]);
        assert_eq!(config.emit, EmitKind::Object);
    }

    #[test]
    fn manifest_round_trips_through_toml() {
        let manifest = ProjectManifest {
            include_dirs: vec![PathBuf::from("vendor/include")],
            defines: vec![("NDEBUG".to_string(), None)],
        };
        let text = manifest.to_toml().unwrap();
        let parsed = ProjectManifest::from_toml(&text).unwrap();
        assert_eq!(parsed.include_dirs, manifest.include_dirs);
        assert_eq!(parsed.defines, manifest.defines);
    }

    #[test]
    fn apply_manifest_extends_existing_config() {
        let manifest = ProjectManifest {
            include_dirs: vec![PathBuf::from("include")],
            defines: vec![],
        };
        let config = CompilerConfig::default().apply_manifest(manifest);
        assert_eq!(config.include_dirs, vec![PathBuf::from("include")]);
    }
}
