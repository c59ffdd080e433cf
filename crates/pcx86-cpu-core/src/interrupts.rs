//! Interrupt entry (IVT/IDT) and `IRET` for the CPU core.
//!
//! External interrupts are only taken at instruction boundaries, or at element
//! boundaries of a `REP` string instruction (see [`crate::interp::string`]).
//! In both cases `EIP` still addresses the instruction that has not yet
//! retired, so the saved return address resumes it.

use crate::mem::{CpuBus, MemoryBus};
use crate::state::{CpuMode, CpuState, RFlags, RunState, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CpuExit {
    #[error("IDT entry for vector {0:#04x} lies outside the IDT limit")]
    GateOutsideIdt(u8),
    #[error("IDT entry for vector {0:#04x} is not present")]
    GateNotPresent(u8),
    #[error("IDT entry for vector {vector:#04x} has unsupported gate type {gate_type:#x}")]
    UnsupportedGate { vector: u8, gate_type: u8 },
    #[error("software interrupt {0:#04x} through a gate with DPL below CPL")]
    GatePrivilege(u8),
    #[error("unimplemented opcode {0:#04x}")]
    UnimplementedOpcode(u8),
}

/// Where an interrupt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// Delivered by the interrupt controller (a hardware IRQ line).
    External,
    /// Raised by the instruction stream (`INT n`).
    Software,
}

/// External interrupt controller as seen by the execution core.
///
/// Both methods take `&self`: controllers are shared with device threads and
/// synchronize internally.
pub trait InterruptController {
    /// Cheap check, run on every instruction boundary and before every `REP`
    /// element: is some line pending, unmasked and deliverable right now?
    fn interrupt_pending(&self) -> bool;

    /// Retire the highest-priority deliverable line into service and return its
    /// vector, or `None` if nothing is deliverable.
    fn acknowledge_interrupt(&self) -> Option<u8>;
}

/// Whether an external interrupt may be taken at the current boundary.
pub fn external_interrupt_window_open(state: &CpuState) -> bool {
    state.rflags.interrupts_enabled() && !state.interrupt_shadow
}

/// Poll `ctrl` and, if a line is deliverable and `IF` permits, enter its handler.
///
/// Returns `true` if an interrupt was delivered. Delivery wakes a halted CPU.
pub fn poll_and_deliver_external_interrupt<B: CpuBus + ?Sized, C: InterruptController + ?Sized>(
    state: &mut CpuState,
    bus: &mut B,
    ctrl: &C,
) -> Result<bool, CpuExit> {
    if !external_interrupt_window_open(state) || !ctrl.interrupt_pending() {
        return Ok(false);
    }

    // The pending summary can be briefly stale when a device thread races the
    // execution thread; acknowledge re-derives from the chip registers.
    let Some(vector) = ctrl.acknowledge_interrupt() else {
        return Ok(false);
    };

    state.set_run_state(RunState::Running);
    interrupt(state, bus, vector, InterruptSource::External)?;
    Ok(true)
}

/// Enter the handler for `vector`, saving the current `CS:EIP` as the return
/// address.
///
/// Callers delivering a software interrupt must advance `EIP` past the `INT`
/// instruction first.
pub fn interrupt<B: MemoryBus + ?Sized>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    source: InterruptSource,
) -> Result<(), CpuExit> {
    tracing::trace!(vector, ?source, mode = ?state.mode, "interrupt entry");
    match state.mode {
        CpuMode::Real => {
            deliver_real_mode(state, bus, vector);
            Ok(())
        }
        CpuMode::Protected => deliver_protected_mode(state, bus, vector, source),
    }
}

fn deliver_real_mode<B: MemoryBus + ?Sized>(state: &mut CpuState, bus: &mut B, vector: u8) {
    let ivt_addr = state.idtr.base.wrapping_add(u64::from(vector) * 4);
    let offset = bus.read_u16(ivt_addr);
    let segment = bus.read_u16(ivt_addr.wrapping_add(2));

    // Push FLAGS, CS, IP (in that order).
    let flags = state.rflags.bits() as u16;
    let cs = state.segment(Segment::Cs).selector;
    let ip = state.eip() as u16;
    push16(state, bus, flags);
    push16(state, bus, cs);
    push16(state, bus, ip);

    // Real-mode INT clears IF and TF.
    state.rflags.remove(RFlags::IF | RFlags::TF);

    state.load_segment(Segment::Cs, segment);
    state.set_ip(u32::from(offset));
}

const GATE_INTERRUPT32: u8 = 0xE;
const GATE_TRAP32: u8 = 0xF;

fn deliver_protected_mode<B: MemoryBus + ?Sized>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    source: InterruptSource,
) -> Result<(), CpuExit> {
    let entry_off = u32::from(vector) * 8;
    if entry_off + 7 > u32::from(state.idtr.limit) {
        return Err(CpuExit::GateOutsideIdt(vector));
    }
    let gate_addr = state.idtr.base.wrapping_add(u64::from(entry_off));
    let offset_lo = bus.read_u16(gate_addr);
    let selector = bus.read_u16(gate_addr.wrapping_add(2));
    let type_attr = bus.read_u8(gate_addr.wrapping_add(5));
    let offset_hi = bus.read_u16(gate_addr.wrapping_add(6));

    if type_attr & 0x80 == 0 {
        return Err(CpuExit::GateNotPresent(vector));
    }
    let gate_type = type_attr & 0x0F;
    if gate_type != GATE_INTERRUPT32 && gate_type != GATE_TRAP32 {
        return Err(CpuExit::UnsupportedGate { vector, gate_type });
    }
    // Hardware interrupts ignore gate DPL; INT n may only use gates at or
    // above the current privilege level.
    let dpl = (type_attr >> 5) & 0b11;
    if source == InterruptSource::Software && dpl < state.cpl() {
        return Err(CpuExit::GatePrivilege(vector));
    }

    let eflags = state.rflags.bits();
    let cs = state.segment(Segment::Cs).selector;
    let eip = state.eip();
    push32(state, bus, eflags);
    push32(state, bus, u32::from(cs));
    push32(state, bus, eip);

    state.rflags.remove(RFlags::TF | RFlags::NT);
    if gate_type == GATE_INTERRUPT32 {
        state.rflags.remove(RFlags::IF);
    }

    state.load_segment(Segment::Cs, selector);
    state.set_ip(u32::from(offset_lo) | (u32::from(offset_hi) << 16));
    Ok(())
}

/// Execute `IRET` for the current mode (same-privilege return only).
pub fn iret<B: MemoryBus + ?Sized>(state: &mut CpuState, bus: &mut B) {
    match state.mode {
        CpuMode::Real => {
            let ip = pop16(state, bus);
            let cs = pop16(state, bus);
            let flags = pop16(state, bus);
            state.load_segment(Segment::Cs, cs);
            state.set_ip(u32::from(ip));
            let upper = state.rflags.bits() & 0xFFFF_0000;
            state.set_rflags(upper | u32::from(flags));
        }
        CpuMode::Protected => {
            let eip = pop32(state, bus);
            let cs = pop32(state, bus);
            let eflags = pop32(state, bus);
            state.load_segment(Segment::Cs, cs as u16);
            state.set_ip(eip);
            state.set_rflags(eflags);
        }
    }
}

fn stack_linear(state: &CpuState, sp: u32) -> u64 {
    state.seg_base(Segment::Ss).wrapping_add(u64::from(sp))
}

pub(crate) fn push16<B: MemoryBus + ?Sized>(state: &mut CpuState, bus: &mut B, value: u16) {
    let sp = (state.gpr[crate::state::gpr::ESP] as u16).wrapping_sub(2);
    state.write_gpr(crate::state::gpr::ESP, 2, u32::from(sp));
    bus.write_u16(stack_linear(state, u32::from(sp)), value);
}

pub(crate) fn push32<B: MemoryBus + ?Sized>(state: &mut CpuState, bus: &mut B, value: u32) {
    let esp = state.gpr[crate::state::gpr::ESP].wrapping_sub(4);
    state.gpr[crate::state::gpr::ESP] = esp;
    bus.write_u32(stack_linear(state, esp), value);
}

pub(crate) fn pop16<B: MemoryBus + ?Sized>(state: &mut CpuState, bus: &mut B) -> u16 {
    let sp = state.gpr[crate::state::gpr::ESP] as u16;
    let value = bus.read_u16(stack_linear(state, u32::from(sp)));
    state.write_gpr(crate::state::gpr::ESP, 2, u32::from(sp.wrapping_add(2)));
    value
}

pub(crate) fn pop32<B: MemoryBus + ?Sized>(state: &mut CpuState, bus: &mut B) -> u32 {
    let esp = state.gpr[crate::state::gpr::ESP];
    let value = bus.read_u32(stack_linear(state, esp));
    state.gpr[crate::state::gpr::ESP] = esp.wrapping_add(4);
    value
}
