//! String instructions and the `REP` driver.
//!
//! A repeated string instruction is interruptible between elements. Before
//! each element the driver asks the interrupt controller whether a line is
//! deliverable; if so (and `IF` is set outside an STI shadow) it stops
//! *without* touching the element, leaving `(E)CX`/`(E)SI`/`(E)DI` as they
//! were after the last whole element and `EIP` on the instruction itself.
//! The dispatcher then delivers the interrupt and the handler's `IRET`
//! resumes the remaining count.

use crate::interp::alu;
use crate::interp::decode::PrefixState;
use crate::interrupts::{external_interrupt_window_open, InterruptController};
use crate::mem::{read_sized, write_sized, CpuBus};
use crate::state::{gpr, CpuMode, CpuState, Segment};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepPrefix {
    #[default]
    None,
    F2,
    F3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepMode {
    None,
    Rep,
    Repe,
    Repne,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrSize {
    A16,
    A32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
    Lods,
    Cmps,
    Scas,
    Ins,
    Outs,
}

impl StringOp {
    /// Only `CMPS`/`SCAS` consult ZF to terminate a repeat.
    fn compares(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }
}

#[derive(Clone, Debug)]
pub struct DecodedStringInst {
    pub op: StringOp,
    pub elem_size: usize,
    pub prefixes: PrefixState,
}

impl DecodedStringInst {
    pub fn new(op: StringOp, elem_size: usize, prefixes: PrefixState) -> Self {
        Self {
            op,
            elem_size,
            prefixes,
        }
    }
}

/// Result of running a string instruction (or one element of it).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringOutcome {
    /// The instruction finished: count exhausted, ZF condition met, or a
    /// single unprefixed element done. `EIP` may advance.
    Completed,
    /// A deliverable interrupt is pending at an element boundary. No partial
    /// element was performed and `EIP` must stay on the instruction.
    AbortedForInterrupt,
}

pub fn exec_string<B: CpuBus + ?Sized, C: InterruptController + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    ints: &C,
    inst: &DecodedStringInst,
) -> StringOutcome {
    let addr_size = effective_addr_size(cpu.mode, &inst.prefixes);
    let rep_mode = effective_rep_mode(inst.op, inst.prefixes.rep);

    if rep_mode == RepMode::None {
        exec_element(cpu, bus, inst, addr_size);
        cpu.cycles += 1;
        return StringOutcome::Completed;
    }

    while read_count(cpu, addr_size) != 0 {
        if step_repeated(cpu, bus, ints, inst, addr_size) == StringOutcome::AbortedForInterrupt {
            tracing::trace!(
                op = ?inst.op,
                remaining = read_count(cpu, addr_size),
                "REP interrupted at element boundary"
            );
            return StringOutcome::AbortedForInterrupt;
        }
        if repeat_terminates(rep_mode, cpu) {
            break;
        }
    }

    StringOutcome::Completed
}

/// One iteration of a repeated string instruction: the interrupt check, then
/// one whole element followed by the count decrement.
fn step_repeated<B: CpuBus + ?Sized, C: InterruptController + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    ints: &C,
    inst: &DecodedStringInst,
    addr_size: AddrSize,
) -> StringOutcome {
    if external_interrupt_window_open(cpu) && ints.interrupt_pending() {
        return StringOutcome::AbortedForInterrupt;
    }

    exec_element(cpu, bus, inst, addr_size);
    cpu.cycles += 1;
    // An STI shadow only covers the boundary before the first element.
    cpu.interrupt_shadow = false;
    let count = read_count(cpu, addr_size);
    write_count(cpu, addr_size, count.wrapping_sub(1));
    StringOutcome::Completed
}

fn repeat_terminates(rep_mode: RepMode, cpu: &CpuState) -> bool {
    match rep_mode {
        RepMode::Repe => !cpu.rflags.zf(),
        RepMode::Repne => cpu.rflags.zf(),
        RepMode::Rep | RepMode::None => false,
    }
}

pub(crate) fn effective_addr_size(mode: CpuMode, p: &PrefixState) -> AddrSize {
    match (mode, p.address_size_override) {
        (CpuMode::Real, false) | (CpuMode::Protected, true) => AddrSize::A16,
        (CpuMode::Real, true) | (CpuMode::Protected, false) => AddrSize::A32,
    }
}

fn effective_rep_mode(op: StringOp, rep: RepPrefix) -> RepMode {
    match rep {
        RepPrefix::None => RepMode::None,
        RepPrefix::F3 if op.compares() => RepMode::Repe,
        RepPrefix::F2 if op.compares() => RepMode::Repne,
        RepPrefix::F2 | RepPrefix::F3 => RepMode::Rep,
    }
}

fn reg_size(addr_size: AddrSize) -> usize {
    match addr_size {
        AddrSize::A16 => 2,
        AddrSize::A32 => 4,
    }
}

pub(crate) fn read_count(cpu: &CpuState, addr_size: AddrSize) -> u32 {
    cpu.read_gpr(gpr::ECX, reg_size(addr_size))
}

fn write_count(cpu: &mut CpuState, addr_size: AddrSize, value: u32) {
    cpu.write_gpr(gpr::ECX, reg_size(addr_size), value);
}

fn step_delta(cpu: &CpuState, elem_size: usize) -> u32 {
    if cpu.rflags.df() {
        (elem_size as u32).wrapping_neg()
    } else {
        elem_size as u32
    }
}

/// Return the current index register value and advance it by one element.
fn take_index(cpu: &mut CpuState, reg: usize, addr_size: AddrSize, elem_size: usize) -> u32 {
    let size = reg_size(addr_size);
    let offset = cpu.read_gpr(reg, size);
    let next = offset.wrapping_add(step_delta(cpu, elem_size));
    cpu.write_gpr(reg, size, next);
    offset
}

fn linear(cpu: &CpuState, seg: Segment, offset: u32) -> u64 {
    cpu.seg_base(seg).wrapping_add(u64::from(offset))
}

fn src_segment(inst: &DecodedStringInst) -> Segment {
    // Only the source (DS:SI) honors a segment override; ES:DI is fixed.
    inst.prefixes.segment_override.unwrap_or(Segment::Ds)
}

fn exec_element<B: CpuBus + ?Sized>(
    cpu: &mut CpuState,
    bus: &mut B,
    inst: &DecodedStringInst,
    addr_size: AddrSize,
) {
    let size = inst.elem_size;
    match inst.op {
        StringOp::Movs => {
            let si = take_index(cpu, gpr::ESI, addr_size, size);
            let di = take_index(cpu, gpr::EDI, addr_size, size);
            let value = read_sized(bus, linear(cpu, src_segment(inst), si), size);
            write_sized(bus, linear(cpu, Segment::Es, di), size, value);
        }
        StringOp::Stos => {
            let di = take_index(cpu, gpr::EDI, addr_size, size);
            let value = cpu.read_gpr(gpr::EAX, size);
            write_sized(bus, linear(cpu, Segment::Es, di), size, value);
        }
        StringOp::Lods => {
            let si = take_index(cpu, gpr::ESI, addr_size, size);
            let value = read_sized(bus, linear(cpu, src_segment(inst), si), size);
            cpu.write_gpr(gpr::EAX, size, value);
        }
        StringOp::Cmps => {
            let si = take_index(cpu, gpr::ESI, addr_size, size);
            let di = take_index(cpu, gpr::EDI, addr_size, size);
            let src_val = read_sized(bus, linear(cpu, src_segment(inst), si), size);
            let dst_val = read_sized(bus, linear(cpu, Segment::Es, di), size);
            // CMPS computes SRC - DEST.
            alu::update_sub_flags(&mut cpu.rflags, src_val, dst_val, size);
        }
        StringOp::Scas => {
            let di = take_index(cpu, gpr::EDI, addr_size, size);
            let mem_val = read_sized(bus, linear(cpu, Segment::Es, di), size);
            let acc_val = cpu.read_gpr(gpr::EAX, size);
            alu::update_sub_flags(&mut cpu.rflags, acc_val, mem_val, size);
        }
        StringOp::Ins => {
            let port = cpu.read_gpr(gpr::EDX, 2) as u16;
            let di = take_index(cpu, gpr::EDI, addr_size, size);
            let value = bus.io_read(port, size as u8);
            write_sized(bus, linear(cpu, Segment::Es, di), size, value);
        }
        StringOp::Outs => {
            let port = cpu.read_gpr(gpr::EDX, 2) as u16;
            let si = take_index(cpu, gpr::ESI, addr_size, size);
            let value = read_sized(bus, linear(cpu, src_segment(inst), si), size);
            bus.io_write(port, size as u8, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{IoBus, MemoryBus};
    use crate::state::RFlags;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Flat RAM whose `n`th byte write flips the "interrupt pending" flag.
    struct TestBus {
        ram: Vec<u8>,
        writes: usize,
        raise_after_writes: Option<usize>,
        pending: Rc<Cell<bool>>,
        port_in: Vec<u8>,
        port_out: Vec<(u16, u32)>,
    }

    impl TestBus {
        fn new() -> Self {
            Self {
                ram: vec![0; 0x1_0000],
                writes: 0,
                raise_after_writes: None,
                pending: Rc::new(Cell::new(false)),
                port_in: Vec::new(),
                port_out: Vec::new(),
            }
        }
    }

    impl MemoryBus for TestBus {
        fn read_u8(&mut self, addr: u64) -> u8 {
            self.ram[addr as usize]
        }

        fn write_u8(&mut self, addr: u64, value: u8) {
            self.ram[addr as usize] = value;
            self.writes += 1;
            if Some(self.writes) == self.raise_after_writes {
                self.pending.set(true);
            }
        }
    }

    impl IoBus for TestBus {
        fn io_read(&mut self, _port: u16, _size: u8) -> u32 {
            u32::from(self.port_in.remove(0))
        }

        fn io_write(&mut self, port: u16, _size: u8, value: u32) {
            self.port_out.push((port, value));
        }
    }

    struct Pending(Rc<Cell<bool>>);

    impl InterruptController for Pending {
        fn interrupt_pending(&self) -> bool {
            self.0.get()
        }

        fn acknowledge_interrupt(&self) -> Option<u8> {
            self.0.replace(false).then_some(0x08)
        }
    }

    struct Never;

    impl InterruptController for Never {
        fn interrupt_pending(&self) -> bool {
            false
        }

        fn acknowledge_interrupt(&self) -> Option<u8> {
            None
        }
    }

    fn cpu() -> CpuState {
        let mut cpu = CpuState::new(CpuMode::Real);
        cpu.load_segment(Segment::Ds, 0);
        cpu.load_segment(Segment::Es, 0);
        cpu.rflags.insert(RFlags::IF);
        cpu
    }

    fn rep(op: StringOp, rep: RepPrefix, elem_size: usize) -> DecodedStringInst {
        DecodedStringInst::new(
            op,
            elem_size,
            PrefixState {
                rep,
                ..PrefixState::default()
            },
        )
    }

    #[test]
    fn unprefixed_movs_moves_one_element_and_ignores_count() {
        let mut cpu = cpu();
        let mut bus = TestBus::new();
        bus.ram[0x100] = 0xAA;
        cpu.gpr[gpr::ECX] = 7;
        cpu.gpr[gpr::ESI] = 0x100;
        cpu.gpr[gpr::EDI] = 0x200;

        let inst = rep(StringOp::Movs, RepPrefix::None, 1);
        assert_eq!(exec_string(&mut cpu, &mut bus, &Never, &inst), StringOutcome::Completed);
        assert_eq!(bus.ram[0x200], 0xAA);
        assert_eq!(cpu.gpr[gpr::ECX], 7);
        assert_eq!(cpu.gpr[gpr::ESI], 0x101);
        assert_eq!(cpu.gpr[gpr::EDI], 0x201);
    }

    #[test]
    fn repne_movsb_interrupted_before_third_element_keeps_progress() {
        let mut cpu = cpu();
        let mut bus = TestBus::new();
        bus.ram[0x100..0x105].copy_from_slice(&[1, 2, 3, 4, 5]);
        bus.raise_after_writes = Some(2);
        cpu.gpr[gpr::ECX] = 5;
        cpu.gpr[gpr::ESI] = 0x100;
        cpu.gpr[gpr::EDI] = 0x200;

        let pending = bus.pending.clone();
        let ctrl = Pending(pending);
        // REPNE on MOVS is an unconditional repeat.
        let inst = rep(StringOp::Movs, RepPrefix::F2, 1);
        let outcome = exec_string(&mut cpu, &mut bus, &ctrl, &inst);

        assert_eq!(outcome, StringOutcome::AbortedForInterrupt);
        assert_eq!(&bus.ram[0x200..0x205], &[1, 2, 0, 0, 0]);
        assert_eq!(cpu.gpr[gpr::ECX], 3);
        assert_eq!(cpu.gpr[gpr::ESI], 0x102);
        assert_eq!(cpu.gpr[gpr::EDI], 0x202);
        assert_eq!(cpu.cycles, 2);

        // Handler ran; re-executing the instruction finishes the remaining elements.
        ctrl.acknowledge_interrupt();
        let outcome = exec_string(&mut cpu, &mut bus, &ctrl, &inst);
        assert_eq!(outcome, StringOutcome::Completed);
        assert_eq!(&bus.ram[0x200..0x205], &[1, 2, 3, 4, 5]);
        assert_eq!(cpu.gpr[gpr::ECX], 0);
        assert_eq!(cpu.gpr[gpr::ESI], 0x105);
    }

    #[test]
    fn pending_interrupt_before_first_element_changes_nothing() {
        let mut cpu = cpu();
        let mut bus = TestBus::new();
        bus.pending.set(true);
        cpu.gpr[gpr::ECX] = 4;
        cpu.gpr[gpr::EDI] = 0x300;
        cpu.gpr[gpr::EAX] = 0x55;

        let pending = bus.pending.clone();
        let inst = rep(StringOp::Stos, RepPrefix::F3, 1);
        let outcome = exec_string(&mut cpu, &mut bus, &Pending(pending), &inst);
        assert_eq!(outcome, StringOutcome::AbortedForInterrupt);
        assert_eq!(cpu.gpr[gpr::ECX], 4);
        assert_eq!(cpu.gpr[gpr::EDI], 0x300);
        assert_eq!(bus.writes, 0);
    }

    #[test]
    fn pending_interrupt_is_ignored_while_if_is_clear() {
        let mut cpu = cpu();
        cpu.rflags.remove(RFlags::IF);
        let mut bus = TestBus::new();
        bus.pending.set(true);
        cpu.gpr[gpr::ECX] = 3;
        cpu.gpr[gpr::EDI] = 0x300;

        let pending = bus.pending.clone();
        let inst = rep(StringOp::Stos, RepPrefix::F3, 2);
        let outcome = exec_string(&mut cpu, &mut bus, &Pending(pending), &inst);
        assert_eq!(outcome, StringOutcome::Completed);
        assert_eq!(cpu.gpr[gpr::ECX], 0);
        assert_eq!(cpu.gpr[gpr::EDI], 0x306);
    }

    #[test]
    fn repe_cmpsb_stops_on_first_mismatch() {
        let mut cpu = cpu();
        let mut bus = TestBus::new();
        bus.ram[0x100..0x104].copy_from_slice(b"abcd");
        bus.ram[0x200..0x204].copy_from_slice(b"abXd");
        cpu.gpr[gpr::ECX] = 4;
        cpu.gpr[gpr::ESI] = 0x100;
        cpu.gpr[gpr::EDI] = 0x200;

        let inst = rep(StringOp::Cmps, RepPrefix::F3, 1);
        exec_string(&mut cpu, &mut bus, &Never, &inst);
        assert!(!cpu.rflags.zf());
        assert_eq!(cpu.gpr[gpr::ECX], 1);
        assert_eq!(cpu.gpr[gpr::ESI], 0x103);
    }

    #[test]
    fn repne_scasb_stops_on_match() {
        let mut cpu = cpu();
        let mut bus = TestBus::new();
        bus.ram[0x200..0x206].copy_from_slice(b"hello\0");
        cpu.gpr[gpr::ECX] = 0xFFFF;
        cpu.gpr[gpr::EDI] = 0x200;
        cpu.gpr[gpr::EAX] = 0;

        let inst = rep(StringOp::Scas, RepPrefix::F2, 1);
        exec_string(&mut cpu, &mut bus, &Never, &inst);
        assert!(cpu.rflags.zf());
        assert_eq!(cpu.gpr[gpr::EDI], 0x206);
        assert_eq!(cpu.gpr[gpr::ECX], 0xFFFF - 6);
    }

    #[test]
    fn std_walks_indices_downwards() {
        let mut cpu = cpu();
        cpu.rflags.insert(RFlags::DF);
        let mut bus = TestBus::new();
        bus.ram[0x100..0x104].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        cpu.gpr[gpr::ECX] = 2;
        cpu.gpr[gpr::ESI] = 0x102;
        cpu.gpr[gpr::EDI] = 0x202;

        let inst = rep(StringOp::Movs, RepPrefix::F3, 2);
        exec_string(&mut cpu, &mut bus, &Never, &inst);
        assert_eq!(&bus.ram[0x200..0x204], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(cpu.gpr[gpr::ESI], 0x0FE);
        assert_eq!(cpu.gpr[gpr::EDI], 0x1FE);
    }

    #[test]
    fn a16_count_and_indices_wrap_at_64k_without_touching_upper_halves() {
        let mut cpu = cpu();
        let mut bus = TestBus::new();
        cpu.gpr[gpr::ECX] = 0xABCD_0002;
        cpu.gpr[gpr::EDI] = 0x1234_FFFF;

        let inst = rep(StringOp::Stos, RepPrefix::F3, 1);
        exec_string(&mut cpu, &mut bus, &Never, &inst);
        assert_eq!(cpu.gpr[gpr::ECX], 0xABCD_0000);
        assert_eq!(cpu.gpr[gpr::EDI], 0x1234_0001);
    }

    #[test]
    fn rep_ins_and_outs_move_between_ports_and_memory() {
        let mut cpu = cpu();
        let mut bus = TestBus::new();
        bus.port_in = vec![0x10, 0x20, 0x30];
        cpu.gpr[gpr::EDX] = 0x60;
        cpu.gpr[gpr::ECX] = 3;
        cpu.gpr[gpr::EDI] = 0x400;

        exec_string(&mut cpu, &mut bus, &Never, &rep(StringOp::Ins, RepPrefix::F3, 1));
        assert_eq!(&bus.ram[0x400..0x403], &[0x10, 0x20, 0x30]);

        cpu.gpr[gpr::EDX] = 0xE9;
        cpu.gpr[gpr::ECX] = 3;
        cpu.gpr[gpr::ESI] = 0x400;
        exec_string(&mut cpu, &mut bus, &Never, &rep(StringOp::Outs, RepPrefix::F3, 1));
        assert_eq!(bus.port_out, vec![(0xE9, 0x10), (0xE9, 0x20), (0xE9, 0x30)]);
    }

    #[test]
    fn zero_count_is_a_no_op() {
        let mut cpu = cpu();
        let mut bus = TestBus::new();
        bus.pending.set(true);
        let pending = bus.pending.clone();
        cpu.gpr[gpr::EDI] = 0x10;
        let inst = rep(StringOp::Stos, RepPrefix::F3, 4);
        let outcome = exec_string(&mut cpu, &mut bus, &Pending(pending), &inst);
        assert_eq!(outcome, StringOutcome::Completed);
        assert_eq!(cpu.gpr[gpr::EDI], 0x10);
    }
}
