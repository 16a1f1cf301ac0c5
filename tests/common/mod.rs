//! Common test utilities and helpers.
//!
//! Synthetic processes made of a protected target module and a kernel32-like
//! export module. Stubs in `.vmp0` push the real import address and return,
//! the shape the resolver expects a virtualized import thunk to end with.

#![allow(dead_code)]

use vmpfix::formats::pe::{Bitness, ImageBuilder, ImportSymbol, SectionFlags};
use vmpfix::{ModuleInfo, SnapshotProcess};

pub const GAME_BASE_64: u64 = 0x1_4000_0000;
pub const GAME_BASE_32: u64 = 0x40_0000;
pub const K32_BASE_64: u64 = 0x7FF8_1000_0000;
pub const K32_BASE_32: u64 = 0x7600_0000;

pub const K32_PATH: &str = r"C:\Windows\System32\KERNEL32.DLL";
pub const GAME_PATH: &str = r"C:\Games\game.exe";

pub const SLEEP_RVA: u32 = 0x1040;
pub const GET_TICK_COUNT_RVA: u32 = 0x1080;

/// RVAs of `.text` and `.vmp0` in every target built here
pub const TEXT_RVA: u32 = 0x1000;
pub const VMP_RVA: u32 = 0x2000;

pub fn k32_base(bitness: Bitness) -> u64 {
    match bitness {
        Bitness::X86 => K32_BASE_32,
        Bitness::X64 => K32_BASE_64,
    }
}

pub fn game_base(bitness: Bitness) -> u64 {
    match bitness {
        Bitness::X86 => GAME_BASE_32,
        Bitness::X64 => GAME_BASE_64,
    }
}

/// Mapped image exporting `Sleep` and `GetTickCount`.
pub fn kernel32(bitness: Bitness) -> Vec<u8> {
    ImageBuilder::new(bitness)
        .with_image_base(k32_base(bitness))
        .with_section(".text", SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ, vec![0xC3; 0x100])
        .with_exports(
            "KERNEL32.dll",
            vec![
                ("Sleep".to_string(), SLEEP_RVA),
                ("GetTickCount".to_string(), GET_TICK_COUNT_RVA),
            ],
        )
        .build_mapped()
        .unwrap()
}

/// Stub that returns into `address`: `mov rax, imm64; push rax; ret` on x64,
/// `push imm32; ret` on x86.
pub fn return_stub(bitness: Bitness, address: u64) -> Vec<u8> {
    match bitness {
        Bitness::X64 => {
            let mut stub = vec![0x48, 0xB8];
            stub.extend_from_slice(&address.to_le_bytes());
            stub.extend_from_slice(&[0x50, 0xC3]);
            stub
        }
        Bitness::X86 => {
            let mut stub = vec![0x68];
            stub.extend_from_slice(&(address as u32).to_le_bytes());
            stub.push(0xC3);
            stub
        }
    }
}

/// `E8 rel32` at `call_rva` targeting `target_rva`.
pub fn call_rel32(call_rva: u32, target_rva: u32) -> [u8; 5] {
    let rel = target_rva.wrapping_sub(call_rva + 5);
    let mut bytes = [0xE8, 0, 0, 0, 0];
    bytes[1..].copy_from_slice(&rel.to_le_bytes());
    bytes
}

/// Builder for a protected target module.
pub struct TargetBuilder {
    bitness: Bitness,
    text: Vec<u8>,
    vmp: Vec<u8>,
    imports: Vec<(String, Vec<ImportSymbol>)>,
}

impl TargetBuilder {
    pub fn new(bitness: Bitness) -> Self {
        Self {
            bitness,
            text: vec![0x90; 0x100],
            vmp: vec![0xCC; 0x100],
            imports: Vec::new(),
        }
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    /// Place a stub at `vmp_offset` returning into `address`.
    pub fn stub(mut self, vmp_offset: usize, address: u64) -> Self {
        let code = return_stub(self.bitness, address);
        self.vmp[vmp_offset..vmp_offset + code.len()].copy_from_slice(&code);
        self
    }

    /// `E8` at `text_offset` into `.vmp0 + vmp_offset`, followed by `int3`.
    pub fn plain_call(mut self, text_offset: usize, vmp_offset: usize) -> Self {
        let call = call_rel32(TEXT_RVA + text_offset as u32, VMP_RVA + vmp_offset as u32);
        self.text[text_offset..text_offset + 5].copy_from_slice(&call);
        self.text[text_offset + 5] = 0xCC;
        self
    }

    /// `push rbx; call` with the `E8` at `text_offset`, followed by
    /// `mov rbx, rax`.
    pub fn push_call(mut self, text_offset: usize, vmp_offset: usize) -> Self {
        let call = call_rel32(TEXT_RVA + text_offset as u32, VMP_RVA + vmp_offset as u32);
        self.text[text_offset - 1] = 0x53;
        self.text[text_offset..text_offset + 5].copy_from_slice(&call);
        self.text[text_offset + 5..text_offset + 8].copy_from_slice(&[0x48, 0x89, 0xC3]);
        self
    }

    /// Raw bytes at `text_offset`.
    pub fn text_bytes(mut self, text_offset: usize, bytes: &[u8]) -> Self {
        self.text[text_offset..text_offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Raw bytes at `.vmp0 + vmp_offset`.
    pub fn vmp_bytes(mut self, vmp_offset: usize, bytes: &[u8]) -> Self {
        self.vmp[vmp_offset..vmp_offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Existing import table entry, placed in `.idata` after `.vmp0`.
    pub fn import(mut self, module: &str, symbols: &[&str]) -> Self {
        let symbols = symbols.iter().map(|s| ImportSymbol::Name(s.to_string())).collect();
        self.imports.push((module.to_string(), symbols));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut builder = ImageBuilder::new(self.bitness)
            .with_image_base(game_base(self.bitness))
            .with_section(
                ".text",
                SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ | SectionFlags::CNT_CODE,
                self.text.clone(),
            )
            .with_section(
                ".vmp0",
                SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
                self.vmp.clone(),
            );
        for (module, symbols) in &self.imports {
            builder = builder.with_import(module.as_str(), symbols.clone());
        }
        builder.build_mapped().unwrap()
    }

    /// The target first, then kernel32.
    pub fn process(&self) -> SnapshotProcess {
        process_with(self.bitness, self.build())
    }
}

pub fn process_with(bitness: Bitness, target: Vec<u8>) -> SnapshotProcess {
    let k32 = kernel32(bitness);
    let target_size = target.len() as u64;
    let k32_size = k32.len() as u64;
    SnapshotProcess::new(bitness)
        .with_module(ModuleInfo::new(GAME_PATH, game_base(bitness), target_size), target)
        .with_module(ModuleInfo::new(K32_PATH, k32_base(bitness), k32_size), k32)
}

/// The canonical scenario: one plain call into a stub resolving to `Sleep`.
pub fn sleep_target(bitness: Bitness) -> TargetBuilder {
    TargetBuilder::new(bitness)
        .stub(0, k32_base(bitness) + u64::from(SLEEP_RVA))
        .plain_call(0, 0)
}

/// Decode the operand of an `FF 15` at `bytes[0..6]`.
pub fn call_operand(bytes: &[u8]) -> u32 {
    assert_eq!(&bytes[..2], &[0xFF, 0x15], "not an indirect call");
    u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]])
}
