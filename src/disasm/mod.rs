//! Disassembler capability used to resolve call-site targets.
//!
//! Only x86/x64 is needed; iced-x86 is the single backend.

use thiserror::Error;

use crate::formats::pe::Bitness;

pub mod iced;

pub use self::iced::IcedDisassembler;

/// Errors that can occur during disassembly operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisasmError {
    #[error("invalid instruction at {address:#x}")]
    InvalidInstruction { address: u64 },
    #[error("insufficient bytes at {address:#x}")]
    InsufficientBytes { address: u64 },
}

/// One decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInsn {
    pub address: u64,
    pub length: usize,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    /// Intel syntax rendering
    pub text: String,
    /// Absolute target of a near branch or RIP-relative operand
    pub target: Option<u64>,
}

impl DecodedInsn {
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.length as u64)
    }
}

pub trait Disassembler {
    fn bitness(&self) -> Bitness;

    /// Decode the instruction at the start of `bytes`, located at `address`.
    fn decode(&self, address: u64, bytes: &[u8]) -> Result<DecodedInsn, DisasmError>;

    /// Absolute address a branch (or memory operand) refers to.
    fn absolute_target(&self, insn: &DecodedInsn) -> Option<u64> {
        insn.target
    }

    fn max_instruction_length(&self) -> usize {
        15
    }

    fn name(&self) -> &str;
}
