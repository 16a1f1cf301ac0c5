//! Call-site classification and `FF 15` encoding.

use serde::{Deserialize, Serialize};

use crate::formats::pe::{Bitness, Image};

/// Length of the `call [slot]` instruction written over a site
pub const PATCH_LEN: usize = 6;

/// Shape of an obfuscated call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    /// `E8 rel32` followed by a filler byte; patched in place
    Plain,
    /// one-byte `push` followed by `E8 rel32`; patched from the push
    PushCall,
}

impl PatchKind {
    /// Buffer offset the 6 patch bytes start at.
    pub fn patch_offset(self, call_offset: usize) -> usize {
        match self {
            PatchKind::Plain => call_offset,
            PatchKind::PushCall => call_offset - 1,
        }
    }
}

/// Decide how the site at `call_offset` is laid out. `Err` carries the
/// reason a site is left alone.
pub fn classify(
    image: &Image,
    call_offset: usize,
    is_filler: impl Fn(u8) -> bool,
) -> Result<PatchKind, String> {
    let next = image
        .read::<u8>(call_offset + 5)
        .map_err(|e| format!("byte after call unreadable: {e}"))?;
    if is_filler(next) {
        return Ok(PatchKind::Plain);
    }
    let prev = match call_offset.checked_sub(1) {
        Some(at) => image
            .read::<u8>(at)
            .map_err(|e| format!("byte before call unreadable: {e}"))?,
        None => return Err("call at buffer start".to_string()),
    };
    if (0x50..=0x57).contains(&prev) {
        Ok(PatchKind::PushCall)
    } else {
        Err(format!(
            "ambiguous site: next byte {next:#04x}, previous byte {prev:#04x}"
        ))
    }
}

/// Encode `call [import slot]` for a patch starting at `patch_rva`.
///
/// x64 uses a RIP-relative displacement measured from the end of the 6
/// bytes. x86 stores the slot's absolute address.
pub fn encode(
    bitness: Bitness,
    image_base: u64,
    patch_rva: u32,
    import_rva: u32,
) -> Result<[u8; PATCH_LEN], String> {
    let slot = image_base.wrapping_add(u64::from(import_rva));
    let operand: u32 = match bitness {
        Bitness::X64 => {
            let next = image_base
                .wrapping_add(u64::from(patch_rva))
                .wrapping_add(PATCH_LEN as u64);
            let disp = slot.wrapping_sub(next) as i64;
            i32::try_from(disp)
                .map_err(|_| format!("slot {slot:#x} out of rel32 range from {next:#x}"))?
                as u32
        }
        Bitness::X86 => u32::try_from(slot)
            .map_err(|_| format!("slot {slot:#x} does not fit a 32-bit address"))?,
    };
    let mut bytes = [0xFF, 0x15, 0, 0, 0, 0];
    bytes[2..].copy_from_slice(&operand.to_le_bytes());
    Ok(bytes)
}
