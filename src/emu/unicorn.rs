//! Unicorn-engine backend.
//!
//! Execution is single-stepped so the hook can observe each instruction
//! before it runs, mirroring a `UC_HOOK_CODE` callback without handing
//! closures to the engine.

use unicorn_engine::unicorn_const::{Arch, Mode, Permission};
use unicorn_engine::{RegisterX86, Unicorn};

use crate::emu::{CpuView, EmuError, Emulator, HookAction, InstructionHook, Register, Result};
use crate::error::EmulationBudget;
use crate::formats::pe::{Bitness, PAGE_SIZE};

const MAX_INSN_LEN: usize = 15;

pub struct UnicornEmulator {
    bitness: Bitness,
    engine: Unicorn<'static, ()>,
}

fn backend<E: std::fmt::Debug>(err: E) -> EmuError {
    EmuError::Backend(format!("{:?}", err))
}

impl UnicornEmulator {
    pub fn new(bitness: Bitness) -> Result<Self> {
        let mode = match bitness {
            Bitness::X86 => Mode::MODE_32,
            Bitness::X64 => Mode::MODE_64,
        };
        let engine = Unicorn::new(Arch::X86, mode).map_err(backend)?;
        Ok(Self { bitness, engine })
    }

    fn native(&self, reg: Register) -> RegisterX86 {
        let wide = self.bitness == Bitness::X64;
        match reg {
            Register::Rax => if wide { RegisterX86::RAX } else { RegisterX86::EAX },
            Register::Rcx => if wide { RegisterX86::RCX } else { RegisterX86::ECX },
            Register::Rdx => if wide { RegisterX86::RDX } else { RegisterX86::EDX },
            Register::Rbx => if wide { RegisterX86::RBX } else { RegisterX86::EBX },
            Register::Rsp => if wide { RegisterX86::RSP } else { RegisterX86::ESP },
            Register::Rbp => if wide { RegisterX86::RBP } else { RegisterX86::EBP },
            Register::Rsi => if wide { RegisterX86::RSI } else { RegisterX86::ESI },
            Register::Rdi => if wide { RegisterX86::RDI } else { RegisterX86::EDI },
            Register::R8 => RegisterX86::R8,
            Register::R9 => RegisterX86::R9,
            Register::R10 => RegisterX86::R10,
            Register::R11 => RegisterX86::R11,
            Register::R12 => RegisterX86::R12,
            Register::R13 => RegisterX86::R13,
            Register::R14 => RegisterX86::R14,
            Register::R15 => RegisterX86::R15,
            Register::Rip => if wide { RegisterX86::RIP } else { RegisterX86::EIP },
            Register::Rflags => RegisterX86::EFLAGS,
        }
    }

    fn fetch(&self, address: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_INSN_LEN);
        let mut byte = [0u8; 1];
        for i in 0..MAX_INSN_LEN as u64 {
            if self.engine.mem_read(address + i, &mut byte).is_err() {
                break;
            }
            out.push(byte[0]);
        }
        out
    }
}

impl CpuView for UnicornEmulator {
    fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn register(&self, reg: Register) -> u64 {
        self.engine.reg_read(self.native(reg)).unwrap_or(0)
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.engine
            .mem_read(address, buf)
            .map_err(|_| EmuError::Unmapped {
                address,
                size: buf.len(),
            })
    }
}

impl Emulator for UnicornEmulator {
    fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn map(&mut self, address: u64, size: u64) -> Result<()> {
        let page = u64::from(PAGE_SIZE);
        let base = address & !(page - 1);
        let end = (address + size + page - 1) & !(page - 1);
        self.engine
            .mem_map(base, (end - base) as usize, Permission::ALL)
            .map_err(|_| EmuError::MapOverlap { address })
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.engine
            .mem_write(address, data)
            .map_err(|_| EmuError::Unmapped {
                address,
                size: data.len(),
            })
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        CpuView::read_memory(self, address, buf)
    }

    fn read_register(&self, reg: Register) -> Result<u64> {
        self.engine.reg_read(self.native(reg)).map_err(backend)
    }

    fn write_register(&mut self, reg: Register, value: u64) -> Result<()> {
        let native = self.native(reg);
        self.engine.reg_write(native, value).map_err(backend)
    }

    fn emulate(
        &mut self,
        begin: u64,
        budget: &EmulationBudget,
        hook: &mut dyn InstructionHook,
    ) -> Result<u64> {
        let mut pc = begin;
        let mut executed = 0u64;
        loop {
            let bytes = self.fetch(pc);
            if bytes.is_empty() {
                return Err(EmuError::Unmapped { address: pc, size: 1 });
            }
            if hook.on_instruction(&*self, pc, &bytes) == HookAction::Stop {
                return Ok(executed);
            }
            if executed >= budget.max_instructions {
                return Err(EmuError::BudgetExhausted {
                    limit: budget.max_instructions,
                });
            }
            self.engine.emu_start(pc, 0, 0, 1).map_err(backend)?;
            executed += 1;
            pc = self.register(Register::Rip);
        }
    }

    fn name(&self) -> &str {
        "unicorn"
    }
}
