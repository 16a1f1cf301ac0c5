//! Error types for the vmpfix resolution engine.
//!
//! Run-fatal conditions are variants of [`FixerError`]; per-call-site
//! failures never surface here and are recorded in the run report instead.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::emu::EmuError;
use crate::formats::pe::PeError;
use crate::process::ProcessError;

/// Main error type for vmpfix operations.
#[derive(Debug, Error)]
pub enum FixerError {
    /// Image parsing or mutation failed
    #[error("PE error: {0}")]
    Pe(#[from] PeError),

    /// The process collaborator reported no modules
    #[error("No modules loaded in the target process")]
    NoModules,

    /// Module enumeration or memory access failed
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// An explicitly named target module is not loaded
    #[error("Target module not found: {0}")]
    TargetNotFound(String),

    /// A required section is absent from the target image
    #[error("Section {name} not found in {module}")]
    SectionMissing { name: String, module: String },

    /// The code section holds no call pattern at all
    #[error("No call sites matching {pattern} in {section}")]
    NoCallSites { pattern: String, section: String },

    /// Emulator could not be created or primed
    #[error("Emulator initialization failed: {0}")]
    EmulatorInit(#[from] EmuError),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for vmpfix operations
pub type Result<T> = std::result::Result<T, FixerError>;

/// Per-candidate emulation budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulationBudget {
    /// Maximum number of instructions executed for one call site
    pub max_instructions: u64,
}

impl Default for EmulationBudget {
    fn default() -> Self {
        Self {
            max_instructions: 100_000,
        }
    }
}

impl fmt::Display for EmulationBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Budget: {} instructions per call site", self.max_instructions)
    }
}
