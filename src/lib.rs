//! Resolution of virtualized import calls in protected PE modules.
//!
//! A protected module calls its imports through stubs in a dedicated
//! section. [`fixer::ImportFixer`] emulates each stub, resolves the export it
//! lands on, and rewrites the call to go through a regular import slot.

/// Run configuration
pub mod config;

/// Export name demangling
pub mod demangle;

/// Instruction decoding
pub mod disasm;

/// CPU emulation backends
pub mod emu;

/// Error types
pub mod error;

/// Candidate scanning, emulation and patching
pub mod fixer;

/// Binary formats
pub mod formats;

/// Logging and tracing set-up
pub mod logging;

/// Process and module collaborators
pub mod process;

pub use config::{EmulatorBackend, FixerConfig};
pub use error::{EmulationBudget, FixerError, Result};
pub use fixer::{FixOutcome, FixReport, ImportFixer, RunState};
pub use formats::pe::{Bitness, Image, ImageBuilder};
pub use process::{ModuleInfo, ProcessSource, SnapshotProcess};
