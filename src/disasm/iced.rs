use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter, OpKind};

use crate::disasm::{DecodedInsn, Disassembler, DisasmError};
use crate::formats::pe::Bitness;

pub struct IcedDisassembler {
    bitness: Bitness,
}

impl IcedDisassembler {
    pub fn new(bitness: Bitness) -> Self {
        Self { bitness }
    }

    fn branch_target(instr: &iced_x86::Instruction) -> Option<u64> {
        for i in 0..instr.op_count() {
            match instr.op_kind(i) {
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    return Some(instr.near_branch_target());
                }
                OpKind::Memory if instr.is_ip_rel_memory_operand() => {
                    return Some(instr.ip_rel_memory_address());
                }
                _ => {}
            }
        }
        None
    }
}

impl Disassembler for IcedDisassembler {
    fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn decode(&self, address: u64, bytes: &[u8]) -> Result<DecodedInsn, DisasmError> {
        let mut decoder = Decoder::with_ip(self.bitness.bits(), bytes, address, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(match decoder.last_error() {
                iced_x86::DecoderError::NoMoreBytes => DisasmError::InsufficientBytes { address },
                _ => DisasmError::InvalidInstruction { address },
            });
        }
        let len = instr.len();
        let mut fmt = IntelFormatter::new();
        let mut text = String::new();
        fmt.format(&instr, &mut text);
        let mnemonic = match text.split_once(' ') {
            Some((m, _)) => m.to_string(),
            None => text.clone(),
        };

        Ok(DecodedInsn {
            address,
            length: len,
            bytes: bytes[..len.min(bytes.len())].to_vec(),
            mnemonic,
            text,
            target: Self::branch_target(&instr),
        })
    }

    fn name(&self) -> &str {
        "iced-x86"
    }
}
