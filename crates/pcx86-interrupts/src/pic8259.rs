//! Dual 8259A programmable interrupt controller (master + cascaded slave).
//!
//! All chip registers are atomics so the controller can be shared through an
//! `Arc` with device threads that raise and lower lines, while the execution
//! thread services requests and programs the chips through the I/O ports.
//!
//! Besides the per-chip registers, the pair maintains a 16-bit *pending
//! summary*: bit `n` is set when global line `n` is requested and not masked
//! (`(master.req & !master.mask) | (slave.req & !slave.mask) << 8`). The CPU
//! polls only this word, so it must never read "nothing pending" after a
//! device has raised an unmasked line. Every mutation of a request or mask
//! register ends with [`DualPic8259::refresh_pending`], which publishes the
//! derived value and re-derives until the published word is stable.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

use pcx86_cpu_core::InterruptController;
use tracing::{debug, trace, warn};

use crate::error::PicError;

pub const MASTER_CMD: u16 = 0x20;
pub const MASTER_DATA: u16 = 0x21;
pub const SLAVE_CMD: u16 = 0xA0;
pub const SLAVE_DATA: u16 = 0xA1;

/// Master input the slave's INT output is wired to.
pub const CASCADE_LINE: u8 = 2;
const CASCADE_BIT: u8 = 1 << CASCADE_LINE;

pub const DEFAULT_MASTER_VECTOR_BASE: u8 = 0x08;
pub const DEFAULT_SLAVE_VECTOR_BASE: u8 = 0x70;

const OCW2_NON_SPECIFIC_EOI: u8 = 0x20;
const OCW2_SPECIFIC_EOI: u8 = 0x60;

const ICW1_IC4: u8 = 0x01;
const ICW1_SNGL: u8 = 0x02;

const OCW3_READ_ISR: u8 = 0x01;
const OCW3_RR: u8 = 0x02;
const OCW3_POLL: u8 = 0x04;
const OCW3_SMM: u8 = 0x20;
const OCW3_ESMM: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicId {
    Master,
    Slave,
}

impl PicId {
    /// First global line number handled by this chip.
    pub fn line_base(self) -> u8 {
        match self {
            PicId::Master => 0,
            PicId::Slave => 8,
        }
    }

    fn index(self) -> usize {
        match self {
            PicId::Master => 0,
            PicId::Slave => 1,
        }
    }

    fn peer(self) -> PicId {
        match self {
            PicId::Master => PicId::Slave,
            PicId::Slave => PicId::Master,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Power-on state: configured vector bases, no cascade/ICW4 setup.
    Hardware,
    /// Clears requests, in-service bits, masks and the init sequence but keeps
    /// the programmed vector base and ICW configuration.
    Software,
}

#[derive(Debug)]
struct ChipRegs {
    request: AtomicU8,
    mask: AtomicU8,
    in_service: AtomicU8,
    vector_base: AtomicU8,
    power_on_vector_base: u8,

    expect_icw2: AtomicBool,
    expect_icw3: AtomicBool,
    expect_icw4: AtomicBool,
    single: AtomicBool,
    cascade_config: AtomicU8,
    icw4: AtomicU8,

    read_isr: AtomicBool,
    special_mask: AtomicBool,
}

impl ChipRegs {
    fn new(vector_base: u8) -> Self {
        Self {
            request: AtomicU8::new(0),
            mask: AtomicU8::new(0),
            in_service: AtomicU8::new(0),
            vector_base: AtomicU8::new(vector_base & 0xF8),
            power_on_vector_base: vector_base & 0xF8,
            expect_icw2: AtomicBool::new(false),
            expect_icw3: AtomicBool::new(false),
            expect_icw4: AtomicBool::new(false),
            single: AtomicBool::new(false),
            cascade_config: AtomicU8::new(0),
            icw4: AtomicU8::new(0),
            read_isr: AtomicBool::new(false),
            special_mask: AtomicBool::new(false),
        }
    }

    fn clear_protocol(&self) {
        self.expect_icw2.store(false, Ordering::Relaxed);
        self.expect_icw3.store(false, Ordering::Relaxed);
        self.expect_icw4.store(false, Ordering::Relaxed);
        self.read_isr.store(false, Ordering::Relaxed);
        self.special_mask.store(false, Ordering::Relaxed);
    }

    fn unmasked_requests(&self) -> u8 {
        self.request.load(Ordering::SeqCst) & !self.mask.load(Ordering::SeqCst)
    }
}

/// The master/slave pair, the pending summary and the global ignore switch.
///
/// Share it between threads as `Arc<DualPic8259>`; all methods take `&self`.
#[derive(Debug)]
pub struct DualPic8259 {
    chips: [ChipRegs; 2],
    pending: AtomicU16,
    ignore_all: AtomicBool,
}

impl Default for DualPic8259 {
    fn default() -> Self {
        Self::new(DEFAULT_MASTER_VECTOR_BASE, DEFAULT_SLAVE_VECTOR_BASE)
    }
}

impl DualPic8259 {
    /// Power-on pair: everything unmasked, nothing requested, the given
    /// vector bases (low three bits dropped).
    pub fn new(master_vector_base: u8, slave_vector_base: u8) -> Self {
        Self {
            chips: [
                ChipRegs::new(master_vector_base),
                ChipRegs::new(slave_vector_base),
            ],
            pending: AtomicU16::new(0),
            ignore_all: AtomicBool::new(false),
        }
    }

    pub fn master(&self) -> Pic8259<'_> {
        self.chip(PicId::Master)
    }

    pub fn slave(&self) -> Pic8259<'_> {
        self.chip(PicId::Slave)
    }

    pub fn chip(&self, id: PicId) -> Pic8259<'_> {
        Pic8259 { pair: self, id }
    }

    fn regs(&self, id: PicId) -> &ChipRegs {
        &self.chips[id.index()]
    }

    /// Assert global line `line` (0..=15). Slave lines also assert master
    /// line 2, which devices cannot drive directly.
    pub fn raise_irq(&self, line: u8) {
        let Some((id, bit)) = split_line(line) else {
            debug_assert!(line < 16, "IRQ line {line} out of range");
            warn!(line, "ignoring raise of out-of-range IRQ line");
            return;
        };
        if line == CASCADE_LINE {
            warn!("ignoring raise of master line 2; it follows the slave");
            return;
        }
        self.regs(id).request.fetch_or(bit, Ordering::SeqCst);
        if id == PicId::Slave {
            self.regs(PicId::Master)
                .request
                .fetch_or(CASCADE_BIT, Ordering::SeqCst);
        }
        trace!(line, "IRQ raised");
        self.refresh_pending();
    }

    /// Deassert global line `line`. Master line 2 drops once the slave has
    /// no request left.
    pub fn lower_irq(&self, line: u8) {
        let Some((id, bit)) = split_line(line) else {
            debug_assert!(line < 16, "IRQ line {line} out of range");
            warn!(line, "ignoring lower of out-of-range IRQ line");
            return;
        };
        if line == CASCADE_LINE {
            warn!("ignoring lower of master line 2; it follows the slave");
            return;
        }
        self.regs(id).request.fetch_and(!bit, Ordering::SeqCst);
        if id == PicId::Slave {
            self.sync_cascade();
        }
        trace!(line, "IRQ lowered");
        self.refresh_pending();
    }

    /// Derive master line 2 from the slave's request register.
    fn sync_cascade(&self) {
        let master = &self.regs(PicId::Master).request;
        let slave = &self.regs(PicId::Slave).request;
        if slave.load(Ordering::SeqCst) != 0 {
            master.fetch_or(CASCADE_BIT, Ordering::SeqCst);
            return;
        }
        master.fetch_and(!CASCADE_BIT, Ordering::SeqCst);
        // A slave raise may have landed between the load and the clear.
        if slave.load(Ordering::SeqCst) != 0 {
            master.fetch_or(CASCADE_BIT, Ordering::SeqCst);
        }
    }

    fn derive_pending(&self) -> u16 {
        let master = self.regs(PicId::Master).unmasked_requests();
        let slave = self.regs(PicId::Slave).unmasked_requests();
        u16::from(master) | (u16::from(slave) << 8)
    }

    /// Publish the pending summary derived from the current registers.
    ///
    /// Two threads can derive concurrently and store out of order; re-deriving
    /// after the store and retrying on mismatch means the last writer always
    /// leaves a value consistent with the registers it observed last.
    pub fn refresh_pending(&self) {
        loop {
            let summary = self.derive_pending();
            self.pending.store(summary, Ordering::SeqCst);
            if self.derive_pending() == summary {
                return;
            }
        }
    }

    /// The published pending summary, including master line 2.
    pub fn pending_summary(&self) -> u16 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether `service` would return a vector right now.
    ///
    /// Master line 2 only mirrors slave activity and is never serviced itself,
    /// so it does not count as deliverable on its own.
    pub fn has_deliverable(&self) -> bool {
        !self.ignoring_all()
            && self.pending.load(Ordering::SeqCst) & !u16::from(CASCADE_BIT) != 0
    }

    pub fn set_ignore_all(&self, ignore: bool) {
        self.ignore_all.store(ignore, Ordering::SeqCst);
    }

    pub fn ignoring_all(&self) -> bool {
        self.ignore_all.load(Ordering::SeqCst)
    }

    /// Accept the lowest-numbered deliverable line and return its vector.
    ///
    /// The request bit moves to in-service. For a slave line, master line 2
    /// also goes in-service and its request drops if the slave has nothing
    /// else requested.
    pub fn service(&self) -> Option<u8> {
        if self.ignoring_all() {
            return None;
        }
        loop {
            let deliverable = self.derive_pending() & !u16::from(CASCADE_BIT);
            if deliverable == 0 {
                self.refresh_pending();
                return None;
            }
            let line = deliverable.trailing_zeros() as u8;
            let (id, bit) = split_line(line)?;
            let regs = self.regs(id);
            // A device thread may have lowered the line since the snapshot.
            if regs.request.fetch_and(!bit, Ordering::SeqCst) & bit == 0 {
                continue;
            }
            regs.in_service.fetch_or(bit, Ordering::SeqCst);
            if id == PicId::Slave {
                self.regs(PicId::Master)
                    .in_service
                    .fetch_or(CASCADE_BIT, Ordering::SeqCst);
                self.sync_cascade();
            }
            self.refresh_pending();

            let vector = regs.vector_base.load(Ordering::SeqCst) | (line & 7);
            debug!(line, vector, "servicing IRQ");
            return Some(vector);
        }
    }

    /// Reset both chips and republish the summary.
    pub fn reset(&self, kind: ResetKind) {
        for id in [PicId::Master, PicId::Slave] {
            self.chip(id).reset_registers(kind);
        }
        self.refresh_pending();
        debug!(?kind, "PIC pair reset");
    }

    pub fn port_read_u8(&self, port: u16) -> Result<u8, PicError> {
        let (pic, is_data) = self.decode_port(port)?;
        Ok(if is_data {
            pic.read_mask()
        } else {
            pic.read_status()
        })
    }

    pub fn port_write_u8(&self, port: u16, value: u8) -> Result<(), PicError> {
        let (pic, is_data) = self.decode_port(port)?;
        if is_data {
            pic.write_data(value);
            Ok(())
        } else {
            pic.write_command(value)
        }
    }

    fn decode_port(&self, port: u16) -> Result<(Pic8259<'_>, bool), PicError> {
        match port {
            MASTER_CMD => Ok((self.master(), false)),
            MASTER_DATA => Ok((self.master(), true)),
            SLAVE_CMD => Ok((self.slave(), false)),
            SLAVE_DATA => Ok((self.slave(), true)),
            _ => Err(PicError::NotAPicPort(port)),
        }
    }
}

impl InterruptController for DualPic8259 {
    fn interrupt_pending(&self) -> bool {
        self.has_deliverable()
    }

    fn acknowledge_interrupt(&self) -> Option<u8> {
        self.service()
    }
}

fn split_line(line: u8) -> Option<(PicId, u8)> {
    match line {
        0..=7 => Some((PicId::Master, 1 << line)),
        8..=15 => Some((PicId::Slave, 1 << (line - 8))),
        _ => None,
    }
}

/// One chip of the pair. Cheap to create; it borrows the pair so it can
/// reach its peer and the shared summary.
#[derive(Debug, Clone, Copy)]
pub struct Pic8259<'a> {
    pair: &'a DualPic8259,
    id: PicId,
}

impl<'a> Pic8259<'a> {
    pub fn id(&self) -> PicId {
        self.id
    }

    pub fn peer(&self) -> Pic8259<'a> {
        self.pair.chip(self.id.peer())
    }

    fn regs(&self) -> &'a ChipRegs {
        self.pair.regs(self.id)
    }

    pub fn line_base(&self) -> u8 {
        self.id.line_base()
    }

    pub fn vector_base(&self) -> u8 {
        self.regs().vector_base.load(Ordering::SeqCst)
    }

    pub fn request(&self) -> u8 {
        self.regs().request.load(Ordering::SeqCst)
    }

    pub fn in_service(&self) -> u8 {
        self.regs().in_service.load(Ordering::SeqCst)
    }

    pub fn mask(&self) -> u8 {
        self.regs().mask.load(Ordering::SeqCst)
    }

    pub fn special_mask_mode(&self) -> bool {
        self.regs().special_mask.load(Ordering::Relaxed)
    }

    /// Whether ICW1 configured this chip as the only one in the system.
    pub fn single_mode(&self) -> bool {
        self.regs().single.load(Ordering::Relaxed)
    }

    /// The last ICW3 value (slave mask on the master, identity on the slave).
    pub fn cascade_config(&self) -> u8 {
        self.regs().cascade_config.load(Ordering::Relaxed)
    }

    pub fn icw4(&self) -> u8 {
        self.regs().icw4.load(Ordering::Relaxed)
    }

    /// Raise chip-local input `index` (0..=7).
    pub fn raise(&self, index: u8) {
        self.pair.raise_irq(self.line_base() + (index & 7));
    }

    pub fn lower(&self, index: u8) {
        self.pair.lower_irq(self.line_base() + (index & 7));
    }

    /// Command port write: ICW1, OCW2 or OCW3 depending on bits 4 and 3.
    pub fn write_command(&self, value: u8) -> Result<(), PicError> {
        let regs = self.regs();
        match value & 0x18 {
            0x10 | 0x18 => {
                // ICW1: restart the init sequence.
                regs.request.store(0, Ordering::SeqCst);
                regs.in_service.store(0, Ordering::SeqCst);
                regs.mask.store(0, Ordering::SeqCst);
                regs.read_isr.store(false, Ordering::Relaxed);
                regs.special_mask.store(false, Ordering::Relaxed);
                let single = value & ICW1_SNGL != 0;
                regs.single.store(single, Ordering::Relaxed);
                regs.expect_icw2.store(true, Ordering::Relaxed);
                regs.expect_icw3.store(!single, Ordering::Relaxed);
                regs.expect_icw4
                    .store(value & ICW1_IC4 != 0, Ordering::Relaxed);
                self.pair.sync_cascade();
                self.pair.refresh_pending();
                debug!(pic = ?self.id, icw1 = value, "PIC init started");
                Ok(())
            }
            0x08 => self.write_ocw3(value),
            _ => self.write_ocw2(value),
        }
    }

    fn write_ocw2(&self, value: u8) -> Result<(), PicError> {
        let in_service = &self.regs().in_service;
        if value == OCW2_NON_SPECIFIC_EOI {
            let isr = in_service.load(Ordering::SeqCst);
            if isr == 0 {
                return Err(PicError::EoiWithNothingInService);
            }
            // Fully nested mode: the highest priority in-service line is the
            // lowest numbered one.
            in_service.fetch_and(!(isr & isr.wrapping_neg()), Ordering::SeqCst);
            Ok(())
        } else if value & 0xF8 == OCW2_SPECIFIC_EOI {
            in_service.fetch_and(!(1 << (value & 7)), Ordering::SeqCst);
            Ok(())
        } else {
            Err(PicError::UnsupportedCommand(value))
        }
    }

    fn write_ocw3(&self, value: u8) -> Result<(), PicError> {
        if value & OCW3_POLL != 0 {
            return Err(PicError::PollModeUnsupported(value));
        }
        let regs = self.regs();
        if value & OCW3_RR != 0 {
            regs.read_isr
                .store(value & OCW3_READ_ISR != 0, Ordering::Relaxed);
        }
        if value & OCW3_ESMM != 0 {
            regs.special_mask
                .store(value & OCW3_SMM != 0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Data port write: the next expected ICW, otherwise OCW1 (mask).
    pub fn write_data(&self, value: u8) {
        let regs = self.regs();
        if regs.expect_icw2.swap(false, Ordering::Relaxed) {
            regs.vector_base.store(value & 0xF8, Ordering::SeqCst);
            debug!(pic = ?self.id, vector_base = value & 0xF8, "ICW2");
            return;
        }
        if regs.expect_icw3.swap(false, Ordering::Relaxed) {
            regs.cascade_config.store(value, Ordering::Relaxed);
            return;
        }
        if regs.expect_icw4.swap(false, Ordering::Relaxed) {
            regs.icw4.store(value, Ordering::Relaxed);
            return;
        }
        regs.mask.store(value, Ordering::SeqCst);
        self.pair.refresh_pending();
    }

    /// Command port read: IRR, or ISR after OCW3 selected it.
    pub fn read_status(&self) -> u8 {
        if self.regs().read_isr.load(Ordering::Relaxed) {
            self.in_service()
        } else {
            self.request()
        }
    }

    pub fn read_mask(&self) -> u8 {
        self.mask()
    }

    fn reset_registers(&self, kind: ResetKind) {
        let regs = self.regs();
        regs.request.store(0, Ordering::SeqCst);
        regs.in_service.store(0, Ordering::SeqCst);
        regs.mask.store(0, Ordering::SeqCst);
        regs.clear_protocol();
        if kind == ResetKind::Hardware {
            regs.vector_base
                .store(regs.power_on_vector_base, Ordering::SeqCst);
            regs.single.store(false, Ordering::Relaxed);
            regs.cascade_config.store(0, Ordering::Relaxed);
            regs.icw4.store(0, Ordering::Relaxed);
        }
    }
}
