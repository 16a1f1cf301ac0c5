//! Minimal x86/x64 interpreter built on the iced-x86 decoder.
//!
//! Covers the integer subset VMProtect import stubs and their mutation junk
//! are made of: moves, stack traffic, add/sub/logic with flags, shifts and
//! rotates (including through carry and double-precision), bit tests and
//! scans, multiplies, `lea`, `xchg`/`xadd`, `bswap`, `lahf`/`sahf`,
//! conditional moves, and every kind of branch. Anything else stops
//! emulation with [`EmuError::Unsupported`].

use iced_x86::{
    ConditionCode, Decoder, DecoderOptions, FlowControl, Formatter, Instruction, IntelFormatter,
    Mnemonic, OpKind, Register as IcedRegister,
};
use tracing::trace;

use crate::emu::memory::GuestMemory;
use crate::emu::{CpuView, EmuError, Emulator, HookAction, InstructionHook, Register, Result};
use crate::error::EmulationBudget;
use crate::formats::pe::Bitness;

const MAX_INSN_LEN: usize = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    cf: bool,
    pf: bool,
    af: bool,
    zf: bool,
    sf: bool,
    df: bool,
    of: bool,
}

impl Flags {
    fn to_bits(self) -> u64 {
        u64::from(self.cf)
            | 0x2
            | u64::from(self.pf) << 2
            | u64::from(self.af) << 4
            | u64::from(self.zf) << 6
            | u64::from(self.sf) << 7
            | u64::from(self.df) << 10
            | u64::from(self.of) << 11
    }

    fn from_bits(v: u64) -> Self {
        Self {
            cf: v & 1 != 0,
            pf: v & (1 << 2) != 0,
            af: v & (1 << 4) != 0,
            zf: v & (1 << 6) != 0,
            sf: v & (1 << 7) != 0,
            df: v & (1 << 10) != 0,
            of: v & (1 << 11) != 0,
        }
    }

    fn holds(self, cc: ConditionCode) -> bool {
        match cc {
            ConditionCode::None => true,
            ConditionCode::o => self.of,
            ConditionCode::no => !self.of,
            ConditionCode::b => self.cf,
            ConditionCode::ae => !self.cf,
            ConditionCode::e => self.zf,
            ConditionCode::ne => !self.zf,
            ConditionCode::be => self.cf || self.zf,
            ConditionCode::a => !self.cf && !self.zf,
            ConditionCode::s => self.sf,
            ConditionCode::ns => !self.sf,
            ConditionCode::p => self.pf,
            ConditionCode::np => !self.pf,
            ConditionCode::l => self.sf != self.of,
            ConditionCode::ge => self.sf == self.of,
            ConditionCode::le => self.zf || self.sf != self.of,
            ConditionCode::g => !self.zf && self.sf == self.of,
        }
    }
}

#[inline]
fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

#[inline]
fn sign_bit(size: usize) -> u64 {
    1u64 << (size * 8 - 1)
}

#[inline]
fn sign_extend(value: u64, size: usize) -> u64 {
    if size >= 8 {
        return value;
    }
    let shift = 64 - size * 8;
    (((value << shift) as i64) >> shift) as u64
}

pub struct LiteEmulator {
    bitness: Bitness,
    regs: [u64; 16],
    rip: u64,
    flags: Flags,
    memory: GuestMemory,
}

impl LiteEmulator {
    pub fn new(bitness: Bitness) -> Self {
        Self {
            bitness,
            regs: [0; 16],
            rip: 0,
            flags: Flags::default(),
            memory: GuestMemory::default(),
        }
    }

    fn addr_mask(&self) -> u64 {
        match self.bitness {
            Bitness::X86 => 0xFFFF_FFFF,
            Bitness::X64 => u64::MAX,
        }
    }

    fn unsupported(instr: &Instruction) -> EmuError {
        let mut text = String::new();
        IntelFormatter::new().format(instr, &mut text);
        EmuError::Unsupported {
            address: instr.ip(),
            text,
        }
    }

    // Registers

    fn gpr_slot(reg: IcedRegister) -> Option<(usize, u32)> {
        match reg {
            IcedRegister::AH => Some((0, 8)),
            IcedRegister::CH => Some((1, 8)),
            IcedRegister::DH => Some((2, 8)),
            IcedRegister::BH => Some((3, 8)),
            r if r.is_gpr() => {
                Some(((r.full_register() as usize) - (IcedRegister::RAX as usize), 0))
            }
            _ => None,
        }
    }

    fn read_reg(&self, instr: &Instruction, reg: IcedRegister) -> Result<u64> {
        let (idx, shift) = Self::gpr_slot(reg).ok_or_else(|| Self::unsupported(instr))?;
        Ok((self.regs[idx] >> shift) & mask(reg.size()))
    }

    fn write_reg(&mut self, instr: &Instruction, reg: IcedRegister, value: u64) -> Result<()> {
        let (idx, shift) = Self::gpr_slot(reg).ok_or_else(|| Self::unsupported(instr))?;
        let size = reg.size();
        self.regs[idx] = match size {
            1 | 2 => {
                let m = mask(size) << shift;
                (self.regs[idx] & !m) | ((value & mask(size)) << shift)
            }
            4 => value & 0xFFFF_FFFF,
            _ => value,
        };
        Ok(())
    }

    fn sp(&self) -> u64 {
        self.regs[4] & self.addr_mask()
    }

    fn set_sp(&mut self, value: u64) {
        self.regs[4] = value & self.addr_mask();
    }

    // Memory

    fn effective_address(&self, instr: &Instruction) -> Result<u64> {
        if matches!(instr.memory_segment(), IcedRegister::FS | IcedRegister::GS) {
            return Err(Self::unsupported(instr));
        }
        if instr.is_ip_rel_memory_operand() {
            return Ok(instr.ip_rel_memory_address() & self.addr_mask());
        }
        let mut address = instr.memory_displacement64();
        if instr.memory_base() != IcedRegister::None {
            address = address.wrapping_add(self.read_reg(instr, instr.memory_base())?);
        }
        if instr.memory_index() != IcedRegister::None {
            let index = self.read_reg(instr, instr.memory_index())?;
            address = address.wrapping_add(index.wrapping_mul(u64::from(instr.memory_index_scale())));
        }
        Ok(address & self.addr_mask())
    }

    fn read_mem(&self, address: u64, size: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.memory.read(address, &mut buf[..size])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_mem(&mut self, address: u64, size: usize, value: u64) -> Result<()> {
        self.memory.write(address, &value.to_le_bytes()[..size])
    }

    fn push(&mut self, value: u64, size: usize) -> Result<()> {
        let sp = self.sp().wrapping_sub(size as u64) & self.addr_mask();
        self.write_mem(sp, size, value)?;
        self.set_sp(sp);
        Ok(())
    }

    fn pop(&mut self, size: usize) -> Result<u64> {
        let sp = self.sp();
        let value = self.read_mem(sp, size)?;
        self.set_sp(sp.wrapping_add(size as u64));
        Ok(value)
    }

    // Operands

    fn op_size(&self, instr: &Instruction, op: u32) -> usize {
        match instr.op_kind(op) {
            OpKind::Register => instr.op_register(op).size(),
            OpKind::Memory => instr.memory_size().size(),
            OpKind::Immediate8 | OpKind::Immediate8_2nd => 1,
            OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
            OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
            _ => 8,
        }
    }

    fn read_op(&self, instr: &Instruction, op: u32) -> Result<u64> {
        match instr.op_kind(op) {
            OpKind::Register => self.read_reg(instr, instr.op_register(op)),
            OpKind::Memory => {
                let address = self.effective_address(instr)?;
                self.read_mem(address, instr.memory_size().size())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(instr.immediate(op)),
            _ => Err(Self::unsupported(instr)),
        }
    }

    fn write_op(&mut self, instr: &Instruction, op: u32, value: u64) -> Result<()> {
        match instr.op_kind(op) {
            OpKind::Register => self.write_reg(instr, instr.op_register(op), value),
            OpKind::Memory => {
                let address = self.effective_address(instr)?;
                let size = instr.memory_size().size();
                self.write_mem(address, size, value & mask(size))
            }
            _ => Err(Self::unsupported(instr)),
        }
    }

    // Flags

    fn set_szp(&mut self, result: u64, size: usize) {
        let r = result & mask(size);
        self.flags.zf = r == 0;
        self.flags.sf = r & sign_bit(size) != 0;
        self.flags.pf = (r as u8).count_ones() % 2 == 0;
    }

    fn alu_add(&mut self, a: u64, b: u64, carry: bool, size: usize) -> u64 {
        let m = mask(size);
        let (a, b) = (a & m, b & m);
        let full = u128::from(a) + u128::from(b) + u128::from(carry);
        let r = (full as u64) & m;
        self.flags.cf = full > u128::from(m);
        self.flags.of = (a ^ r) & (b ^ r) & sign_bit(size) != 0;
        self.flags.af = (a ^ b ^ r) & 0x10 != 0;
        self.set_szp(r, size);
        r
    }

    fn alu_sub(&mut self, a: u64, b: u64, borrow: bool, size: usize) -> u64 {
        let m = mask(size);
        let (a, b) = (a & m, b & m);
        let r = a.wrapping_sub(b).wrapping_sub(u64::from(borrow)) & m;
        self.flags.cf = u128::from(a) < u128::from(b) + u128::from(borrow);
        self.flags.of = (a ^ b) & (a ^ r) & sign_bit(size) != 0;
        self.flags.af = (a ^ b ^ r) & 0x10 != 0;
        self.set_szp(r, size);
        r
    }

    fn alu_logic(&mut self, r: u64, size: usize) -> u64 {
        self.flags.cf = false;
        self.flags.of = false;
        self.flags.af = false;
        self.set_szp(r, size);
        r & mask(size)
    }

    fn alu_shift(&mut self, mnemonic: Mnemonic, a: u64, count: u64, size: usize) -> u64 {
        let bits = (size * 8) as u64;
        let m = mask(size);
        let a = a & m;
        let msb = |v: u64| v & sign_bit(size) != 0;
        match mnemonic {
            Mnemonic::Shl | Mnemonic::Sal => {
                let r = (a << count) & m;
                self.flags.cf = count <= bits && (a >> (bits - count)) & 1 != 0;
                self.flags.of = msb(r) != self.flags.cf;
                self.set_szp(r, size);
                r
            }
            Mnemonic::Shr => {
                let r = a >> count;
                self.flags.cf = (a >> (count - 1)) & 1 != 0;
                self.flags.of = msb(a);
                self.set_szp(r, size);
                r
            }
            Mnemonic::Sar => {
                let signed = sign_extend(a, size) as i64;
                let r = ((signed >> count.min(63)) as u64) & m;
                self.flags.cf = (signed >> (count - 1).min(63)) & 1 != 0;
                self.flags.of = false;
                self.set_szp(r, size);
                r
            }
            Mnemonic::Rol => {
                let c = count % bits;
                let r = if c == 0 { a } else { ((a << c) | (a >> (bits - c))) & m };
                self.flags.cf = r & 1 != 0;
                self.flags.of = msb(r) != self.flags.cf;
                r
            }
            // Ror
            _ => {
                let c = count % bits;
                let r = if c == 0 { a } else { ((a >> c) | (a << (bits - c))) & m };
                self.flags.cf = msb(r);
                self.flags.of = msb(r) != (r & (sign_bit(size) >> 1) != 0);
                r
            }
        }
    }

    fn alu_rotate_carry(&mut self, mnemonic: Mnemonic, a: u64, count: u64, size: usize) -> u64 {
        let bits = (size * 8) as u64;
        let m = mask(size);
        let msb = |v: u64| v & sign_bit(size) != 0;
        let mut r = a & m;
        let mut cf = self.flags.cf;
        for _ in 0..count % (bits + 1) {
            if mnemonic == Mnemonic::Rcl {
                let out = msb(r);
                r = ((r << 1) | u64::from(cf)) & m;
                cf = out;
            } else {
                let out = r & 1 != 0;
                r = (r >> 1) | (u64::from(cf) << (bits - 1));
                cf = out;
            }
        }
        self.flags.cf = cf;
        self.flags.of = if mnemonic == Mnemonic::Rcl {
            msb(r) != cf
        } else {
            msb(r) != (r & (sign_bit(size) >> 1) != 0)
        };
        r
    }

    /// `shld`/`shrd` over the `dst:src` (or `src:dst`) double-width value.
    fn alu_double_shift(
        &mut self,
        mnemonic: Mnemonic,
        dst: u64,
        src: u64,
        count: u64,
        size: usize,
    ) -> u64 {
        let bits = (size * 8) as u32;
        let m = mask(size);
        let (dst, src) = (dst & m, src & m);
        let count = count as u32;
        let (r, cf) = if mnemonic == Mnemonic::Shld {
            let joined = (u128::from(dst) << bits) | u128::from(src);
            let r = ((joined << count) >> bits) as u64 & m;
            (r, (joined >> (2 * bits - count)) & 1 != 0)
        } else {
            let joined = (u128::from(src) << bits) | u128::from(dst);
            ((joined >> count) as u64 & m, (joined >> (count - 1)) & 1 != 0)
        };
        self.flags.cf = cf;
        self.flags.of = (r ^ dst) & sign_bit(size) != 0;
        self.set_szp(r, size);
        r
    }

    /// `bt`, `bts`, `btr`, `btc`. A register bit offset into memory may
    /// address bytes outside the operand.
    fn bit_test(&mut self, instr: &Instruction, size: usize) -> Result<()> {
        let offset = self.read_op(instr, 1)?;
        let bits = (size * 8) as u64;
        let (address, bit, width) = match (instr.op_kind(0), instr.op_kind(1)) {
            (OpKind::Memory, OpKind::Register) => {
                let signed = sign_extend(offset & mask(size), size) as i64;
                let ea = self.effective_address(instr)?;
                let address = ea.wrapping_add((signed >> 3) as u64) & self.addr_mask();
                (Some(address), (signed & 7) as u64, 1)
            }
            (OpKind::Memory, _) => (Some(self.effective_address(instr)?), offset % bits, size),
            _ => (None, offset % bits, size),
        };
        let value = match address {
            Some(at) => self.read_mem(at, width)?,
            None => self.read_op(instr, 0)?,
        };
        self.flags.cf = (value >> bit) & 1 != 0;
        let updated = match instr.mnemonic() {
            Mnemonic::Bts => value | (1u64 << bit),
            Mnemonic::Btr => value & !(1u64 << bit),
            Mnemonic::Btc => value ^ (1u64 << bit),
            _ => return Ok(()),
        };
        match address {
            Some(at) => self.write_mem(at, width, updated),
            None => self.write_op(instr, 0, updated),
        }
    }

    /// One-operand `mul`/`imul`: the accumulator times the operand into
    /// the `D:A` pair (`AX` for bytes).
    fn multiply_wide(&mut self, instr: &Instruction, size: usize) -> Result<()> {
        let bits = (size * 8) as u32;
        let m = mask(size);
        let a = self.regs[0] & m;
        let b = self.read_op(instr, 0)? & m;
        let (lo, hi, overflow) = if instr.mnemonic() == Mnemonic::Imul {
            let full =
                i128::from(sign_extend(a, size) as i64) * i128::from(sign_extend(b, size) as i64);
            let lo = full as u64 & m;
            let overflow = full != i128::from(sign_extend(lo, size) as i64);
            (lo, (full >> bits) as u64 & m, overflow)
        } else {
            let full = u128::from(a) * u128::from(b);
            let hi = (full >> bits) as u64 & m;
            (full as u64 & m, hi, hi != 0)
        };
        match size {
            1 => self.write_reg(instr, IcedRegister::AX, lo | (hi << 8))?,
            2 => {
                self.write_reg(instr, IcedRegister::AX, lo)?;
                self.write_reg(instr, IcedRegister::DX, hi)?;
            }
            4 => {
                self.write_reg(instr, IcedRegister::EAX, lo)?;
                self.write_reg(instr, IcedRegister::EDX, hi)?;
            }
            _ => {
                self.write_reg(instr, IcedRegister::RAX, lo)?;
                self.write_reg(instr, IcedRegister::RDX, hi)?;
            }
        }
        self.flags.cf = overflow;
        self.flags.of = overflow;
        Ok(())
    }

    // Execution

    fn execute(&mut self, instr: &Instruction) -> Result<()> {
        let size = self.op_size(instr, 0);
        match instr.mnemonic() {
            Mnemonic::Nop | Mnemonic::Pause => {}
            Mnemonic::Mov => {
                let v = self.read_op(instr, 1)?;
                self.write_op(instr, 0, v)?;
            }
            Mnemonic::Movzx => {
                let v = self.read_op(instr, 1)?;
                self.write_op(instr, 0, v)?;
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let src = self.op_size(instr, 1);
                let v = sign_extend(self.read_op(instr, 1)?, src);
                self.write_op(instr, 0, v & mask(size))?;
            }
            Mnemonic::Lea => {
                let address = self.effective_address(instr)?;
                self.write_op(instr, 0, address & mask(size))?;
            }
            Mnemonic::Xchg => {
                let a = self.read_op(instr, 0)?;
                let b = self.read_op(instr, 1)?;
                self.write_op(instr, 0, b)?;
                self.write_op(instr, 1, a)?;
            }
            Mnemonic::Bswap => {
                let v = self.read_op(instr, 0)?;
                let swapped = if size == 8 {
                    v.swap_bytes()
                } else {
                    u64::from((v as u32).swap_bytes())
                };
                self.write_op(instr, 0, swapped)?;
            }
            Mnemonic::Push => {
                let width = instr.stack_pointer_increment().unsigned_abs() as usize;
                let v = self.read_op(instr, 0)?;
                self.push(v & mask(width), width)?;
            }
            Mnemonic::Pop => {
                let width = instr.stack_pointer_increment().unsigned_abs() as usize;
                let v = self.pop(width)?;
                self.write_op(instr, 0, v)?;
            }
            Mnemonic::Pushf | Mnemonic::Pushfd | Mnemonic::Pushfq => {
                let width = instr.stack_pointer_increment().unsigned_abs() as usize;
                self.push(self.flags.to_bits(), width)?;
            }
            Mnemonic::Popf | Mnemonic::Popfd | Mnemonic::Popfq => {
                let width = instr.stack_pointer_increment().unsigned_abs() as usize;
                let v = self.pop(width)?;
                self.flags = Flags::from_bits(v);
            }
            Mnemonic::Add | Mnemonic::Adc => {
                let carry = instr.mnemonic() == Mnemonic::Adc && self.flags.cf;
                let (a, b) = (self.read_op(instr, 0)?, self.read_op(instr, 1)?);
                let r = self.alu_add(a, b, carry, size);
                self.write_op(instr, 0, r)?;
            }
            Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp => {
                let borrow = instr.mnemonic() == Mnemonic::Sbb && self.flags.cf;
                let (a, b) = (self.read_op(instr, 0)?, self.read_op(instr, 1)?);
                let r = self.alu_sub(a, b, borrow, size);
                if instr.mnemonic() != Mnemonic::Cmp {
                    self.write_op(instr, 0, r)?;
                }
            }
            Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => {
                let (a, b) = (self.read_op(instr, 0)?, self.read_op(instr, 1)?);
                let raw = match instr.mnemonic() {
                    Mnemonic::Or => a | b,
                    Mnemonic::Xor => a ^ b,
                    _ => a & b,
                };
                let r = self.alu_logic(raw, size);
                if instr.mnemonic() != Mnemonic::Test {
                    self.write_op(instr, 0, r)?;
                }
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let cf = self.flags.cf;
                let a = self.read_op(instr, 0)?;
                let r = if instr.mnemonic() == Mnemonic::Inc {
                    self.alu_add(a, 1, false, size)
                } else {
                    self.alu_sub(a, 1, false, size)
                };
                self.flags.cf = cf;
                self.write_op(instr, 0, r)?;
            }
            Mnemonic::Neg => {
                let a = self.read_op(instr, 0)?;
                let r = self.alu_sub(0, a, false, size);
                self.flags.cf = a & mask(size) != 0;
                self.write_op(instr, 0, r)?;
            }
            Mnemonic::Not => {
                let a = self.read_op(instr, 0)?;
                self.write_op(instr, 0, !a & mask(size))?;
            }
            Mnemonic::Shl | Mnemonic::Sal | Mnemonic::Shr | Mnemonic::Sar | Mnemonic::Rol
            | Mnemonic::Ror => {
                let limit = if size == 8 { 0x3F } else { 0x1F };
                let count = self.read_op(instr, 1)? & limit;
                if count != 0 {
                    let a = self.read_op(instr, 0)?;
                    let r = self.alu_shift(instr.mnemonic(), a, count, size);
                    self.write_op(instr, 0, r)?;
                }
            }
            Mnemonic::Rcl | Mnemonic::Rcr => {
                let limit = if size == 8 { 0x3F } else { 0x1F };
                let count = self.read_op(instr, 1)? & limit;
                if count != 0 {
                    let a = self.read_op(instr, 0)?;
                    let r = self.alu_rotate_carry(instr.mnemonic(), a, count, size);
                    self.write_op(instr, 0, r)?;
                }
            }
            Mnemonic::Shld | Mnemonic::Shrd => {
                let limit = if size == 8 { 0x3F } else { 0x1F };
                let count = self.read_op(instr, 2)? & limit;
                if count != 0 {
                    let (dst, src) = (self.read_op(instr, 0)?, self.read_op(instr, 1)?);
                    let r = self.alu_double_shift(instr.mnemonic(), dst, src, count, size);
                    self.write_op(instr, 0, r)?;
                }
            }
            Mnemonic::Bt | Mnemonic::Bts | Mnemonic::Btr | Mnemonic::Btc => {
                self.bit_test(instr, size)?;
            }
            Mnemonic::Bsf | Mnemonic::Bsr => {
                let v = self.read_op(instr, 1)? & mask(size);
                self.flags.zf = v == 0;
                if v != 0 {
                    let index = if instr.mnemonic() == Mnemonic::Bsf {
                        v.trailing_zeros()
                    } else {
                        63 - v.leading_zeros()
                    };
                    self.write_op(instr, 0, u64::from(index))?;
                }
            }
            Mnemonic::Xadd => {
                let (a, b) = (self.read_op(instr, 0)?, self.read_op(instr, 1)?);
                let r = self.alu_add(a, b, false, size);
                self.write_op(instr, 1, a)?;
                self.write_op(instr, 0, r)?;
            }
            Mnemonic::Mul => self.multiply_wide(instr, size)?,
            Mnemonic::Imul if instr.op_count() == 1 => self.multiply_wide(instr, size)?,
            Mnemonic::Imul => {
                let (x, y) = if instr.op_count() == 3 { (1, 2) } else { (0, 1) };
                let a = sign_extend(self.read_op(instr, x)? & mask(size), size) as i64;
                let b = sign_extend(self.read_op(instr, y)? & mask(size), size) as i64;
                let full = i128::from(a) * i128::from(b);
                let r = full as u64 & mask(size);
                let overflow = full != i128::from(sign_extend(r, size) as i64);
                self.flags.cf = overflow;
                self.flags.of = overflow;
                self.write_op(instr, 0, r)?;
            }
            Mnemonic::Lahf => {
                let ah = self.flags.to_bits() & 0xD5 | 0x2;
                self.write_reg(instr, IcedRegister::AH, ah)?;
            }
            Mnemonic::Sahf => {
                let ah = self.read_reg(instr, IcedRegister::AH)?;
                let keep = self.flags.to_bits() & !0xD5;
                self.flags = Flags::from_bits(keep | (ah & 0xD5));
            }
            Mnemonic::Cbw | Mnemonic::Cwde | Mnemonic::Cdqe => {
                let (from, to) = match instr.mnemonic() {
                    Mnemonic::Cbw => (1, IcedRegister::AX),
                    Mnemonic::Cwde => (2, IcedRegister::EAX),
                    _ => (4, IcedRegister::RAX),
                };
                let v = sign_extend(self.regs[0] & mask(from), from);
                self.write_reg(instr, to, v)?;
            }
            Mnemonic::Cwd | Mnemonic::Cdq | Mnemonic::Cqo => {
                let (width, dst) = match instr.mnemonic() {
                    Mnemonic::Cwd => (2, IcedRegister::DX),
                    Mnemonic::Cdq => (4, IcedRegister::EDX),
                    _ => (8, IcedRegister::RDX),
                };
                let negative = self.regs[0] & sign_bit(width) != 0;
                self.write_reg(instr, dst, if negative { u64::MAX } else { 0 })?;
            }
            Mnemonic::Clc => self.flags.cf = false,
            Mnemonic::Stc => self.flags.cf = true,
            Mnemonic::Cmc => self.flags.cf = !self.flags.cf,
            Mnemonic::Cld => self.flags.df = false,
            Mnemonic::Std => self.flags.df = true,
            Mnemonic::Cmovo
            | Mnemonic::Cmovno
            | Mnemonic::Cmovb
            | Mnemonic::Cmovae
            | Mnemonic::Cmove
            | Mnemonic::Cmovne
            | Mnemonic::Cmovbe
            | Mnemonic::Cmova
            | Mnemonic::Cmovs
            | Mnemonic::Cmovns
            | Mnemonic::Cmovp
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovl
            | Mnemonic::Cmovge
            | Mnemonic::Cmovle
            | Mnemonic::Cmovg => {
                // A 32-bit destination is zero-extended even when not taken.
                let v = if self.flags.holds(instr.condition_code()) {
                    self.read_op(instr, 1)?
                } else {
                    self.read_op(instr, 0)?
                };
                self.write_op(instr, 0, v)?;
            }
            Mnemonic::Seto
            | Mnemonic::Setno
            | Mnemonic::Setb
            | Mnemonic::Setae
            | Mnemonic::Sete
            | Mnemonic::Setne
            | Mnemonic::Setbe
            | Mnemonic::Seta
            | Mnemonic::Sets
            | Mnemonic::Setns
            | Mnemonic::Setp
            | Mnemonic::Setnp
            | Mnemonic::Setl
            | Mnemonic::Setge
            | Mnemonic::Setle
            | Mnemonic::Setg => {
                let v = u64::from(self.flags.holds(instr.condition_code()));
                self.write_op(instr, 0, v)?;
            }
            _ => return Err(Self::unsupported(instr)),
        }
        Ok(())
    }

    fn branch_target(&self, instr: &Instruction) -> Result<u64> {
        match instr.op_kind(0) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(instr.near_branch_target())
            }
            OpKind::Register | OpKind::Memory => {
                Ok(self.read_op(instr, 0)? & self.addr_mask())
            }
            _ => Err(Self::unsupported(instr)),
        }
    }

    /// Execute one decoded instruction and advance the instruction pointer.
    fn step(&mut self, instr: &Instruction) -> Result<()> {
        let word = self.bitness.word_size();
        let next = instr.next_ip() & self.addr_mask();
        self.rip = match instr.flow_control() {
            FlowControl::Next => {
                self.execute(instr)?;
                next
            }
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch => {
                self.branch_target(instr)?
            }
            FlowControl::ConditionalBranch => {
                let taken = match instr.mnemonic() {
                    Mnemonic::Jecxz => self.regs[1] & 0xFFFF_FFFF == 0,
                    Mnemonic::Jrcxz => self.regs[1] == 0,
                    _ if instr.condition_code() != ConditionCode::None => {
                        self.flags.holds(instr.condition_code())
                    }
                    _ => return Err(Self::unsupported(instr)),
                };
                if taken {
                    self.branch_target(instr)?
                } else {
                    next
                }
            }
            FlowControl::Call | FlowControl::IndirectCall => {
                let target = self.branch_target(instr)?;
                self.push(next, word)?;
                target
            }
            FlowControl::Return => {
                let target = self.pop(word)? & self.addr_mask();
                if matches!(instr.mnemonic(), Mnemonic::Retf) {
                    self.pop(word)?;
                }
                if instr.op_count() > 0 {
                    let extra = self.read_op(instr, 0)?;
                    self.set_sp(self.sp().wrapping_add(extra));
                }
                target
            }
            _ => return Err(Self::unsupported(instr)),
        };
        Ok(())
    }

    fn decode_at(&self, pc: u64) -> Result<(Instruction, Vec<u8>)> {
        let bytes = self.memory.fetch(pc, MAX_INSN_LEN);
        if bytes.is_empty() {
            return Err(EmuError::Unmapped {
                address: pc,
                size: 1,
            });
        }
        let mut decoder = Decoder::with_ip(self.bitness.bits(), &bytes, pc, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(EmuError::InvalidInstruction { address: pc });
        }
        let len = instr.len();
        Ok((instr, bytes[..len].to_vec()))
    }
}

impl CpuView for LiteEmulator {
    fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn register(&self, reg: Register) -> u64 {
        let value = match reg {
            Register::Rip => self.rip,
            Register::Rflags => self.flags.to_bits(),
            gpr => gpr.gpr_index().map(|i| self.regs[i]).unwrap_or(0),
        };
        value & self.addr_mask()
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.read(address, buf)
    }
}

impl Emulator for LiteEmulator {
    fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn map(&mut self, address: u64, size: u64) -> Result<()> {
        self.memory.map(address, size)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.memory.write(address, data)
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.read(address, buf)
    }

    fn read_register(&self, reg: Register) -> Result<u64> {
        Ok(self.register(reg))
    }

    fn write_register(&mut self, reg: Register, value: u64) -> Result<()> {
        let value = value & self.addr_mask();
        match reg {
            Register::Rip => self.rip = value,
            Register::Rflags => self.flags = Flags::from_bits(value),
            gpr => {
                if let Some(i) = gpr.gpr_index() {
                    self.regs[i] = value;
                }
            }
        }
        Ok(())
    }

    fn emulate(
        &mut self,
        begin: u64,
        budget: &EmulationBudget,
        hook: &mut dyn InstructionHook,
    ) -> Result<u64> {
        self.rip = begin & self.addr_mask();
        let mut executed = 0u64;
        loop {
            let pc = self.rip;
            let (instr, bytes) = self.decode_at(pc)?;
            if hook.on_instruction(&*self, pc, &bytes) == HookAction::Stop {
                trace!(executed, pc = format_args!("{:#x}", pc), "emulation stopped by hook");
                return Ok(executed);
            }
            if executed >= budget.max_instructions {
                return Err(EmuError::BudgetExhausted {
                    limit: budget.max_instructions,
                });
            }
            self.step(&instr)?;
            executed += 1;
        }
    }

    fn name(&self) -> &str {
        "lite"
    }
}
