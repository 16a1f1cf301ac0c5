//! Run state and the serializable outcome of one fixing run.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fixer::patch::PatchKind;

/// Progress of an [`ImportFixer`](crate::fixer::ImportFixer) run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    ModulesLoaded,
    SectionsMapped,
    Scanning,
    Emulating,
    Patched,
    Written,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::ModulesLoaded => "modules-loaded",
            RunState::SectionsMapped => "sections-mapped",
            RunState::Scanning => "scanning",
            RunState::Emulating => "emulating",
            RunState::Patched => "patched",
            RunState::Written => "written",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A call site rewritten to `call [slot]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchedSite {
    /// RVA of the original `E8`
    pub call_rva: u32,
    /// RVA the six patch bytes start at
    pub patch_rva: u32,
    pub kind: PatchKind,
    pub module: String,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demangled: Option<String>,
    pub import_rva: u32,
    /// Whether the slot was created during this run
    pub import_added: bool,
    pub instructions: u64,
}

/// A candidate left untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSite {
    pub call_rva: u32,
    pub target: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FixReport {
    pub target_module: String,
    pub target_path: String,
    pub image_base: u64,
    pub bitness: u32,
    /// `E8` pattern matches in the code section
    pub call_matches: usize,
    /// Matches whose target lies in the protected section
    pub candidates: usize,
    pub patched: Vec<PatchedSite>,
    pub skipped: Vec<SkippedSite>,
    /// Distinct import slots added to the image
    pub imports_added: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl FixReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Candidates left untouched, for any reason
    pub fn failures(&self) -> usize {
        self.skipped.len()
    }
}

impl fmt::Display for FixReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} candidates, {} patched, {} skipped, {} imports added",
            self.target_module,
            self.candidates,
            self.patched.len(),
            self.skipped.len(),
            self.imports_added
        )
    }
}
