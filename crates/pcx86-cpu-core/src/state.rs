//! Architectural CPU state.
//!
//! Segmentation is modelled only as far as interrupt entry needs it: real mode
//! derives a segment base from its selector, protected mode assumes flat
//! (base 0) descriptors. Descriptor table walking belongs to the MMU.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RFlags: u32 {
        const CF = 1 << 0;
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 0b11 << 12;
        const NT = 1 << 14;
    }
}

impl RFlags {
    pub fn zf(&self) -> bool {
        self.contains(Self::ZF)
    }

    pub fn df(&self) -> bool {
        self.contains(Self::DF)
    }

    /// Whether maskable (external) interrupts are enabled.
    pub fn interrupts_enabled(&self) -> bool {
        self.contains(Self::IF)
    }
}

impl Default for RFlags {
    fn default() -> Self {
        Self::RESERVED1
    }
}

/// General purpose register indices, in ModRM/opcode encoding order.
pub mod gpr {
    pub const EAX: usize = 0;
    pub const ECX: usize = 1;
    pub const EDX: usize = 2;
    pub const EBX: usize = 3;
    pub const ESP: usize = 4;
    pub const EBP: usize = 5;
    pub const ESI: usize = 6;
    pub const EDI: usize = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    /// 16-bit real mode: IVT at linear 0, `selector << 4` segment bases.
    Real,
    /// 32-bit protected mode with flat segments and a 32-bit IDT.
    Protected,
}

/// Segment registers, in opcode encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl Segment {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentReg {
    pub selector: u16,
    pub base: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Running,
    /// Stopped by `HLT`; only a delivered external interrupt resumes fetch.
    Halted,
}

#[derive(Debug, Clone)]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub rflags: RFlags,
    eip: u32,
    segments: [SegmentReg; 6],
    pub mode: CpuMode,
    pub idtr: DescriptorTable,
    pub run_state: RunState,
    /// Element/instruction counter. String instructions advance it once per
    /// element so long `REP` runs are visible to time-keeping code.
    pub cycles: u64,
    /// One-instruction interrupt shadow set by `STI`.
    pub interrupt_shadow: bool,
}

impl CpuState {
    pub fn new(mode: CpuMode) -> Self {
        let mut state = Self {
            gpr: [0; 8],
            rflags: RFlags::default(),
            eip: 0,
            segments: [SegmentReg::default(); 6],
            mode,
            idtr: DescriptorTable {
                base: 0,
                limit: 0x3FF,
            },
            run_state: RunState::Running,
            cycles: 0,
            interrupt_shadow: false,
        };
        if mode == CpuMode::Real {
            // Power-on CS:IP is F000:FFF0.
            state.load_segment(Segment::Cs, 0xF000);
            state.eip = 0xFFF0;
        }
        state
    }

    pub fn eip(&self) -> u32 {
        self.eip
    }

    /// Set the instruction pointer, truncated to the current mode's width.
    pub fn set_ip(&mut self, ip: u32) {
        self.eip = match self.mode {
            CpuMode::Real => ip & 0xFFFF,
            CpuMode::Protected => ip,
        };
    }

    pub fn segment(&self, seg: Segment) -> SegmentReg {
        self.segments[seg.index()]
    }

    pub fn seg_base(&self, seg: Segment) -> u64 {
        self.segments[seg.index()].base
    }

    /// Load a segment register. Real mode recomputes the base from the
    /// selector; protected mode keeps flat segments.
    pub fn load_segment(&mut self, seg: Segment, selector: u16) {
        let base = match self.mode {
            CpuMode::Real => u64::from(selector) << 4,
            CpuMode::Protected => 0,
        };
        self.segments[seg.index()] = SegmentReg { selector, base };
    }

    /// Current privilege level (CS.RPL in protected mode, 0 in real mode).
    pub fn cpl(&self) -> u8 {
        match self.mode {
            CpuMode::Real => 0,
            CpuMode::Protected => (self.segment(Segment::Cs).selector & 0b11) as u8,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.run_state == RunState::Halted
    }

    pub fn set_run_state(&mut self, run_state: RunState) {
        self.run_state = run_state;
    }

    /// Linear address of the next instruction byte.
    pub fn code_linear(&self) -> u64 {
        self.seg_base(Segment::Cs).wrapping_add(u64::from(self.eip))
    }

    pub fn read_gpr(&self, idx: usize, size: usize) -> u32 {
        match size {
            1 => self.read_reg8(idx) as u32,
            2 => self.gpr[idx] & 0xFFFF,
            4 => self.gpr[idx],
            _ => panic!("unsupported register size: {size}"),
        }
    }

    pub fn write_gpr(&mut self, idx: usize, size: usize, value: u32) {
        match size {
            1 => self.write_reg8(idx, value as u8),
            2 => self.gpr[idx] = (self.gpr[idx] & 0xFFFF_0000) | (value & 0xFFFF),
            4 => self.gpr[idx] = value,
            _ => panic!("unsupported register size: {size}"),
        }
    }

    /// 8-bit register by encoding: 0..=3 are AL/CL/DL/BL, 4..=7 are AH/CH/DH/BH.
    pub fn read_reg8(&self, idx: usize) -> u8 {
        if idx < 4 {
            self.gpr[idx] as u8
        } else {
            (self.gpr[idx - 4] >> 8) as u8
        }
    }

    pub fn write_reg8(&mut self, idx: usize, value: u8) {
        if idx < 4 {
            self.gpr[idx] = (self.gpr[idx] & !0xFF) | u32::from(value);
        } else {
            let r = &mut self.gpr[idx - 4];
            *r = (*r & !0xFF00) | (u32::from(value) << 8);
        }
    }

    pub fn set_rflags(&mut self, value: u32) {
        self.rflags = RFlags::from_bits_truncate(value) | RFlags::RESERVED1;
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new(CpuMode::Real)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_power_on_vector() {
        let cpu = CpuState::new(CpuMode::Real);
        assert_eq!(cpu.code_linear(), 0xFFFF0);
        assert!(!cpu.rflags.interrupts_enabled());
    }

    #[test]
    fn byte_registers_alias_low_and_high_halves() {
        let mut cpu = CpuState::default();
        cpu.gpr[gpr::EAX] = 0x1234_5678;
        assert_eq!(cpu.read_reg8(0), 0x78);
        assert_eq!(cpu.read_reg8(4), 0x56);

        cpu.write_reg8(4, 0xAB);
        assert_eq!(cpu.gpr[gpr::EAX], 0x1234_AB78);
        cpu.write_gpr(gpr::EAX, 2, 0xFFFF_0001);
        assert_eq!(cpu.gpr[gpr::EAX], 0x1234_0001);
    }

    #[test]
    fn real_mode_ip_wraps_at_64k() {
        let mut cpu = CpuState::default();
        cpu.set_ip(0x1_0003);
        assert_eq!(cpu.eip(), 3);
    }
}
