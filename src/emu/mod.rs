//! CPU emulation capability.
//!
//! The resolution engine drives an [`Emulator`] one candidate at a time and
//! observes execution through an [`InstructionHook`] that runs before every
//! instruction. Two backends exist: [`lite::LiteEmulator`], an interpreter
//! for the instruction subset found in import stubs, and (behind the
//! `unicorn` feature) `unicorn::UnicornEmulator`.

use thiserror::Error;

use crate::error::EmulationBudget;
use crate::formats::pe::Bitness;

pub mod lite;
mod memory;
#[cfg(feature = "unicorn")]
pub mod unicorn;

pub use lite::LiteEmulator;
#[cfg(feature = "unicorn")]
pub use unicorn::UnicornEmulator;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmuError {
    #[error("unmapped memory access at {address:#x} ({size} bytes)")]
    Unmapped { address: u64, size: usize },
    #[error("mapping at {address:#x} overlaps an existing region")]
    MapOverlap { address: u64 },
    #[error("invalid instruction at {address:#x}")]
    InvalidInstruction { address: u64 },
    #[error("unsupported instruction `{text}` at {address:#x}")]
    Unsupported { address: u64, text: String },
    #[error("divide error at {address:#x}")]
    DivideError { address: u64 },
    #[error("instruction budget of {limit} exhausted")]
    BudgetExhausted { limit: u64 },
    #[error("emulator backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, EmuError>;

/// General purpose registers plus instruction pointer and flags. In 32-bit
/// mode the low halves are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
}

impl Register {
    pub const GPRS: [Register; 16] = [
        Register::Rax,
        Register::Rcx,
        Register::Rdx,
        Register::Rbx,
        Register::Rsp,
        Register::Rbp,
        Register::Rsi,
        Register::Rdi,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];

    /// Index in x86 encoding order, for general purpose registers
    pub fn gpr_index(self) -> Option<usize> {
        Self::GPRS.iter().position(|r| *r == self)
    }
}

/// What to do after a hook has seen an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Halt before the instruction executes
    Stop,
}

/// Read access to CPU state from inside a hook
pub trait CpuView {
    fn bitness(&self) -> Bitness;
    fn register(&self, reg: Register) -> u64;
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Read one pointer-sized little-endian value.
    fn read_word(&self, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        let n = self.bitness().word_size();
        self.read_memory(address, &mut buf[..n])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn stack_pointer(&self) -> u64 {
        self.register(Register::Rsp)
    }
}

/// Called before each instruction with its address and encoded bytes.
pub trait InstructionHook {
    fn on_instruction(&mut self, cpu: &dyn CpuView, address: u64, bytes: &[u8]) -> HookAction;
}

impl<F> InstructionHook for F
where
    F: FnMut(&dyn CpuView, u64, &[u8]) -> HookAction,
{
    fn on_instruction(&mut self, cpu: &dyn CpuView, address: u64, bytes: &[u8]) -> HookAction {
        self(cpu, address, bytes)
    }
}

pub trait Emulator {
    fn bitness(&self) -> Bitness;

    /// Map `size` bytes (rounded up to pages) of zeroed memory at `address`.
    fn map(&mut self, address: u64, size: u64) -> Result<()>;

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()>;

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    fn read_register(&self, reg: Register) -> Result<u64>;

    fn write_register(&mut self, reg: Register, value: u64) -> Result<()>;

    /// Run from `begin` until the hook returns [`HookAction::Stop`]. Any other
    /// termination is an error. Returns the number of instructions executed.
    fn emulate(
        &mut self,
        begin: u64,
        budget: &EmulationBudget,
        hook: &mut dyn InstructionHook,
    ) -> Result<u64>;

    fn write_word(&mut self, address: u64, value: u64) -> Result<()> {
        let n = self.bitness().word_size();
        self.write_memory(address, &value.to_le_bytes()[..n])
    }

    fn name(&self) -> &str;
}

/// Construct the backend selected in the configuration.
pub fn create(
    backend: crate::config::EmulatorBackend,
    bitness: Bitness,
) -> Result<Box<dyn Emulator>> {
    match backend {
        crate::config::EmulatorBackend::Lite => Ok(Box::new(LiteEmulator::new(bitness))),
        #[cfg(feature = "unicorn")]
        crate::config::EmulatorBackend::Unicorn => {
            Ok(Box::new(UnicornEmulator::new(bitness)?))
        }
        #[cfg(not(feature = "unicorn"))]
        crate::config::EmulatorBackend::Unicorn => Err(EmuError::Backend(
            "unicorn support not compiled in".to_string(),
        )),
    }
}
