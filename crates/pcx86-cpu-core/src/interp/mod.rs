//! Minimal fetch/decode/execute for the instructions the interrupt path needs.
//!
//! General ALU/decoder coverage lives outside this crate. What is here is
//! enough to run interrupt handlers (`CLI`/`STI`/`IN`/`OUT`/`IRET`), idle
//! loops (`HLT`/`JMP`) and every string instruction with its prefixes.

pub mod alu;
pub mod decode;
pub mod string;

use crate::interrupts::{self, CpuExit, InterruptController, InterruptSource};
use crate::mem::{CpuBus, MemoryBus};
use crate::state::{gpr, CpuMode, CpuState, RFlags, RunState};
use decode::PrefixState;
use string::{DecodedStringInst, StringOp, StringOutcome};

/// Longest legal x86 instruction.
const MAX_INST_LEN: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The instruction retired and `EIP` moved on.
    Retired,
    /// `HLT` retired; the CPU waits for an external interrupt.
    Halted,
    /// A `REP` string instruction stopped at an element boundary because an
    /// interrupt is deliverable. `EIP` still addresses the instruction; the
    /// caller must deliver the interrupt before fetching again.
    InterruptWindow,
}

struct Fetcher {
    start: u64,
    len: u32,
}

impl Fetcher {
    fn u8<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) -> u8 {
        let b = bus.read_u8(self.start.wrapping_add(u64::from(self.len)));
        self.len += 1;
        b
    }

    fn u16<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) -> u16 {
        u16::from_le_bytes([self.u8(bus), self.u8(bus)])
    }

    fn imm<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, size: usize) -> u32 {
        match size {
            1 => u32::from(self.u8(bus)),
            2 => u32::from(self.u16(bus)),
            _ => u32::from(self.u16(bus)) | (u32::from(self.u16(bus)) << 16),
        }
    }
}

fn operand_size(mode: CpuMode, p: &PrefixState) -> usize {
    match (mode, p.operand_size_override) {
        (CpuMode::Real, false) | (CpuMode::Protected, true) => 2,
        (CpuMode::Real, true) | (CpuMode::Protected, false) => 4,
    }
}

fn string_inst(opcode: u8) -> Option<(StringOp, bool)> {
    // (op, wide): the low opcode bit selects byte vs word/dword.
    let op = match opcode & !1 {
        0xA4 => StringOp::Movs,
        0xA6 => StringOp::Cmps,
        0xAA => StringOp::Stos,
        0xAC => StringOp::Lods,
        0xAE => StringOp::Scas,
        0x6C => StringOp::Ins,
        0x6E => StringOp::Outs,
        _ => return None,
    };
    Some((op, opcode & 1 != 0))
}

/// Execute one instruction at `CS:EIP`.
///
/// Must not be called while the CPU is halted; the machine loop owns wakeup.
///
/// An STI shadow present on entry covers only this instruction (for a `REP`,
/// only its first element boundary) and is gone when this returns.
pub fn step<B: CpuBus + ?Sized, C: InterruptController + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    ints: &C,
) -> Result<StepOutcome, CpuExit> {
    debug_assert!(!cpu.is_halted());

    let shadowed = cpu.interrupt_shadow;
    let outcome = execute(cpu, bus, ints);
    if shadowed {
        cpu.interrupt_shadow = false;
    }
    outcome
}

fn execute<B: CpuBus + ?Sized, C: InterruptController + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    ints: &C,
) -> Result<StepOutcome, CpuExit> {
    let mut f = Fetcher {
        start: cpu.code_linear(),
        len: 0,
    };
    let mut prefixes = PrefixState::default();
    let mut opcode = f.u8(bus);
    while prefixes.absorb(opcode) && f.len < MAX_INST_LEN {
        opcode = f.u8(bus);
    }
    let opsize = operand_size(cpu.mode, &prefixes);

    if let Some((op, wide)) = string_inst(opcode) {
        let elem_size = if wide { opsize } else { 1 };
        let inst = DecodedStringInst::new(op, elem_size, prefixes);
        return Ok(match string::exec_string(cpu, bus, ints, &inst) {
            StringOutcome::Completed => {
                // The string driver already counted its elements.
                advance(cpu, f.len);
                StepOutcome::Retired
            }
            StringOutcome::AbortedForInterrupt => StepOutcome::InterruptWindow,
        });
    }

    let was_if = cpu.rflags.interrupts_enabled();
    match opcode {
        0x90 => {}
        0xF4 => {
            retire(cpu, f.len);
            cpu.set_run_state(RunState::Halted);
            return Ok(StepOutcome::Halted);
        }
        0xFA => cpu.rflags.remove(RFlags::IF),
        0xFB => {
            cpu.rflags.insert(RFlags::IF);
            retire(cpu, f.len);
            // STI enables interrupts only after the following instruction.
            cpu.interrupt_shadow = !was_if;
            return Ok(StepOutcome::Retired);
        }
        0xFC => cpu.rflags.remove(RFlags::DF),
        0xFD => cpu.rflags.insert(RFlags::DF),
        0xCD => {
            let vector = f.u8(bus);
            retire(cpu, f.len);
            interrupts::interrupt(cpu, bus, vector, InterruptSource::Software)?;
            return Ok(StepOutcome::Retired);
        }
        0xCF => {
            interrupts::iret(cpu, bus);
            return Ok(StepOutcome::Retired);
        }
        0xEB => {
            let rel = f.u8(bus) as i8;
            retire(cpu, f.len);
            let target = cpu.eip().wrapping_add(rel as i32 as u32);
            cpu.set_ip(target);
            return Ok(StepOutcome::Retired);
        }
        0x74 | 0x75 => {
            let rel = f.u8(bus) as i8;
            retire(cpu, f.len);
            if cpu.rflags.zf() == (opcode == 0x74) {
                let target = cpu.eip().wrapping_add(rel as i32 as u32);
                cpu.set_ip(target);
            }
            return Ok(StepOutcome::Retired);
        }
        0x40..=0x4F => {
            let reg = usize::from(opcode & 7);
            let value = cpu.read_gpr(reg, opsize);
            let result = alu::inc_dec_with_flags(&mut cpu.rflags, value, opcode >= 0x48, opsize);
            cpu.write_gpr(reg, opsize, result);
        }
        0xB0..=0xB7 => {
            let imm = f.u8(bus);
            cpu.write_reg8(usize::from(opcode & 7), imm);
        }
        0xB8..=0xBF => {
            let imm = f.imm(bus, opsize);
            cpu.write_gpr(usize::from(opcode & 7), opsize, imm);
        }
        0xE4 | 0xE5 | 0xEC | 0xED => {
            let port = if opcode & 0x08 == 0 {
                u16::from(f.u8(bus))
            } else {
                cpu.read_gpr(gpr::EDX, 2) as u16
            };
            let size = if opcode & 1 == 0 { 1 } else { opsize };
            let value = bus.io_read(port, size as u8);
            cpu.write_gpr(gpr::EAX, size, value);
        }
        0xE6 | 0xE7 | 0xEE | 0xEF => {
            let port = if opcode & 0x08 == 0 {
                u16::from(f.u8(bus))
            } else {
                cpu.read_gpr(gpr::EDX, 2) as u16
            };
            let size = if opcode & 1 == 0 { 1 } else { opsize };
            let value = cpu.read_gpr(gpr::EAX, size);
            bus.io_write(port, size as u8, value);
        }
        _ => return Err(CpuExit::UnimplementedOpcode(opcode)),
    }

    retire(cpu, f.len);
    Ok(StepOutcome::Retired)
}

fn advance(cpu: &mut CpuState, len: u32) {
    let next = cpu.eip().wrapping_add(len);
    cpu.set_ip(next);
}

fn retire(cpu: &mut CpuState, len: u32) {
    advance(cpu, len);
    cpu.cycles += 1;
}
