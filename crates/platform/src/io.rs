use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use tracing::{trace, warn};

/// Ports below this are dispatched through a flat table; the rest go through
/// a hash map.
pub const FAST_PORT_LIMIT: u16 = 1024;

bitflags! {
    /// Which directions a device answers on a port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PortAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// A port-mapped peripheral.
///
/// Only byte access is required. Word and dword accesses default to
/// little-endian composition of byte accesses on the same device
/// (`word = port, port + 1`; `dword = two words`); devices may override them
/// when a wide access has to be atomic.
///
/// A device that interrupts owns at most one line handle and drives it
/// itself; the bus never routes interrupts.
pub trait IoDevice {
    fn name(&self) -> &str;

    fn in8(&mut self, port: u16) -> u8;
    fn out8(&mut self, port: u16, value: u8);

    fn in16(&mut self, port: u16) -> u16 {
        let lo = self.in8(port);
        let hi = self.in8(port.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    fn in32(&mut self, port: u16) -> u32 {
        let lo = self.in16(port);
        let hi = self.in16(port.wrapping_add(2));
        u32::from(lo) | (u32::from(hi) << 16)
    }

    fn out16(&mut self, port: u16, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.out8(port, lo);
        self.out8(port.wrapping_add(1), hi);
    }

    fn out32(&mut self, port: u16, value: u32) {
        self.out16(port, value as u16);
        self.out16(port.wrapping_add(2), (value >> 16) as u16);
    }

    /// Reset the device back to its power-on state.
    fn reset(&mut self) {}
}

/// How devices are shared with the bus. The device's owner keeps the strong
/// reference; the bus only holds weak ones.
pub type SharedIoDevice = Rc<RefCell<dyn IoDevice>>;

type WeakIoDevice = Weak<RefCell<dyn IoDevice>>;

#[derive(Default, Clone)]
struct PortSlot {
    input: Option<WeakIoDevice>,
    output: Option<WeakIoDevice>,
}

impl PortSlot {
    fn get(&self, access: PortAccess) -> Option<&WeakIoDevice> {
        if access == PortAccess::READ {
            self.input.as_ref()
        } else {
            self.output.as_ref()
        }
    }

    fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }
}

fn live(entry: Option<&WeakIoDevice>) -> Option<SharedIoDevice> {
    entry.and_then(Weak::upgrade)
}

fn same_device(entry: &Option<WeakIoDevice>, device: &WeakIoDevice) -> bool {
    entry.as_ref().is_some_and(|e| Weak::ptr_eq(e, device))
}

fn unmapped_value(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// Port number to device dispatch.
///
/// Entries do not keep devices alive: once a device's last strong reference
/// is dropped, all of its ports read as unmapped and can be registered again.
pub struct IoPortBus {
    fast: Box<[PortSlot]>,
    slow: HashMap<u16, PortSlot>,
    log_unmapped: bool,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self {
            fast: vec![PortSlot::default(); usize::from(FAST_PORT_LIMIT)].into_boxed_slice(),
            slow: HashMap::new(),
            log_unmapped: false,
        }
    }

    /// Emit a `warn!` for every access to an unmapped port.
    pub fn set_log_unmapped(&mut self, enabled: bool) {
        self.log_unmapped = enabled;
    }

    fn slot(&self, port: u16) -> Option<&PortSlot> {
        if port < FAST_PORT_LIMIT {
            self.fast.get(usize::from(port))
        } else {
            self.slow.get(&port)
        }
    }

    fn slot_mut(&mut self, port: u16) -> &mut PortSlot {
        if port < FAST_PORT_LIMIT {
            &mut self.fast[usize::from(port)]
        } else {
            self.slow.entry(port).or_default()
        }
    }

    /// Map `device` on `port` for the given directions.
    ///
    /// # Panics
    ///
    /// If a live device is already registered on `port` for one of the
    /// requested directions.
    pub fn register(&mut self, port: u16, device: &SharedIoDevice, access: PortAccess) {
        let weak = Rc::downgrade(device);
        let slot = self.slot_mut(port);
        for (dir, entry) in [
            (PortAccess::READ, &mut slot.input),
            (PortAccess::WRITE, &mut slot.output),
        ] {
            if !access.contains(dir) {
                continue;
            }
            if let Some(existing) = live(entry.as_ref()) {
                panic!(
                    "I/O port {port:#06x} ({dir:?}) already registered to {}",
                    existing.borrow().name()
                );
            }
            *entry = Some(weak.clone());
        }
    }

    /// Map `device` on `len` consecutive ports starting at `start`.
    pub fn register_range(
        &mut self,
        start: u16,
        len: u16,
        device: &SharedIoDevice,
        access: PortAccess,
    ) {
        assert!(len != 0, "I/O port range length must be non-zero");
        let end_exclusive = u32::from(start) + u32::from(len);
        assert!(
            end_exclusive <= 0x1_0000,
            "I/O port range wraps past 0xFFFF: start={start:#x} len={len:#x}"
        );
        for offset in 0..len {
            self.register(start + offset, device, access);
        }
    }

    /// Remove the mappings for `port` in the given directions.
    pub fn unregister(&mut self, port: u16, access: PortAccess) {
        let slot = self.slot_mut(port);
        if access.contains(PortAccess::READ) {
            slot.input = None;
        }
        if access.contains(PortAccess::WRITE) {
            slot.output = None;
        }
        if port >= FAST_PORT_LIMIT && slot.is_empty() {
            self.slow.remove(&port);
        }
    }

    /// Remove every mapping that points at `device`.
    pub fn unregister_device(&mut self, device: &SharedIoDevice) {
        let weak = Rc::downgrade(device);
        let clear = |slot: &mut PortSlot| {
            if same_device(&slot.input, &weak) {
                slot.input = None;
            }
            if same_device(&slot.output, &weak) {
                slot.output = None;
            }
        };
        self.fast.iter_mut().for_each(&clear);
        self.slow.values_mut().for_each(&clear);
        self.slow.retain(|_, slot| !slot.is_empty());
    }

    pub fn lookup_input(&self, port: u16) -> Option<SharedIoDevice> {
        live(self.slot(port)?.get(PortAccess::READ))
    }

    pub fn lookup_output(&self, port: u16) -> Option<SharedIoDevice> {
        live(self.slot(port)?.get(PortAccess::WRITE))
    }

    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        if !matches!(size, 1 | 2 | 4) {
            return unmapped_value(size);
        }
        let Some(device) = self.lookup_input(port) else {
            if self.log_unmapped {
                warn!(port, size, "read from unmapped I/O port");
            }
            return unmapped_value(size);
        };
        let mut device = device.borrow_mut();
        let value = match size {
            1 => u32::from(device.in8(port)),
            2 => u32::from(device.in16(port)),
            _ => device.in32(port),
        };
        trace!(device = device.name(), port, size, value, "port read");
        value
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        if !matches!(size, 1 | 2 | 4) {
            return;
        }
        let Some(device) = self.lookup_output(port) else {
            if self.log_unmapped {
                warn!(port, size, value, "write to unmapped I/O port");
            }
            return;
        };
        let mut device = device.borrow_mut();
        trace!(device = device.name(), port, size, value, "port write");
        match size {
            1 => device.out8(port, value as u8),
            2 => device.out16(port, value as u16),
            _ => device.out32(port, value),
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, u32::from(value));
    }

    /// Reset every live device once, however many ports it owns.
    pub fn reset(&mut self) {
        let mut seen: Vec<*const ()> = Vec::new();
        let mut devices = Vec::new();
        for slot in self.fast.iter().chain(self.slow.values()) {
            for entry in [&slot.input, &slot.output] {
                let Some(device) = live(entry.as_ref()) else {
                    continue;
                };
                let key = Rc::as_ptr(&device) as *const ();
                if !seen.contains(&key) {
                    seen.push(key);
                    devices.push(device);
                }
            }
        }
        for device in devices {
            device.borrow_mut().reset();
        }
    }
}

impl Default for IoPortBus {
    fn default() -> Self {
        Self::new()
    }
}

impl pcx86_cpu_core::IoBus for IoPortBus {
    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        self.read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.write(port, size, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Latch {
        base: u16,
        regs: [u8; 4],
        byte_reads: usize,
        resets: usize,
    }

    impl IoDevice for Latch {
        fn name(&self) -> &str {
            "latch"
        }

        fn in8(&mut self, port: u16) -> u8 {
            self.byte_reads += 1;
            self.regs[usize::from(port.wrapping_sub(self.base)) & 3]
        }

        fn out8(&mut self, port: u16, value: u8) {
            self.regs[usize::from(port.wrapping_sub(self.base)) & 3] = value;
        }

        fn reset(&mut self) {
            self.resets += 1;
            self.regs = [0; 4];
        }
    }

    fn latch(base: u16) -> (Rc<RefCell<Latch>>, SharedIoDevice) {
        let dev = Rc::new(RefCell::new(Latch {
            base,
            ..Latch::default()
        }));
        let shared: SharedIoDevice = dev.clone();
        (dev, shared)
    }

    #[test]
    fn unmapped_ports_float_high() {
        let mut bus = IoPortBus::new();
        for port in [0x0000, 0x03F8, 0x0400, 0xFFFF] {
            assert_eq!(bus.read(port, 1), 0xFF);
            assert_eq!(bus.read(port, 2), 0xFFFF);
            assert_eq!(bus.read(port, 4), 0xFFFF_FFFF);
            bus.write(port, 4, 0);
        }
    }

    #[test]
    fn fast_and_slow_ports_dispatch() {
        let mut bus = IoPortBus::new();
        let (low, low_shared) = latch(0x60);
        let (high, high_shared) = latch(0xC000);
        bus.register(0x60, &low_shared, PortAccess::READ_WRITE);
        bus.register(0xC000, &high_shared, PortAccess::READ_WRITE);

        bus.write_u8(0x60, 0x12);
        bus.write_u8(0xC000, 0x34);
        assert_eq!(bus.read_u8(0x60), 0x12);
        assert_eq!(bus.read_u8(0xC000), 0x34);
        assert_eq!(low.borrow().regs[0], 0x12);
        assert_eq!(high.borrow().regs[0], 0x34);
    }

    #[test]
    fn wide_access_composes_bytes_on_the_same_device() {
        let mut bus = IoPortBus::new();
        let (dev, shared) = latch(0x1F0);
        bus.register(0x1F0, &shared, PortAccess::READ_WRITE);

        bus.write(0x1F0, 4, 0x4433_2211);
        assert_eq!(dev.borrow().regs, [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(bus.read(0x1F0, 2), 0x2211);
        assert_eq!(bus.read(0x1F0, 4), 0x4433_2211);
        assert_eq!(dev.borrow().byte_reads, 6);
    }

    #[test]
    fn directions_are_independent() {
        let mut bus = IoPortBus::new();
        let (_reader, reader_shared) = latch(0x80);
        let (writer, writer_shared) = latch(0x80);
        bus.register(0x80, &reader_shared, PortAccess::READ);
        bus.register(0x80, &writer_shared, PortAccess::WRITE);

        bus.write_u8(0x80, 0x5A);
        assert_eq!(writer.borrow().regs[0], 0x5A);
        assert_eq!(bus.read_u8(0x80), 0);
        assert!(bus.lookup_input(0x81).is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration_panics() {
        let mut bus = IoPortBus::new();
        let (_a, a) = latch(0x70);
        let (_b, b) = latch(0x70);
        bus.register(0x70, &a, PortAccess::READ_WRITE);
        bus.register(0x70, &b, PortAccess::WRITE);
    }

    #[test]
    fn dropped_device_reads_as_unmapped_and_can_be_replaced() {
        let mut bus = IoPortBus::new();
        {
            let (_dev, shared) = latch(0x2000);
            bus.register_range(0x2000, 4, &shared, PortAccess::READ_WRITE);
            bus.write_u8(0x2001, 7);
            assert_eq!(bus.read_u8(0x2001), 7);
        }
        assert_eq!(bus.read_u8(0x2001), 0xFF);

        let (_dev, shared) = latch(0x2000);
        bus.register_range(0x2000, 4, &shared, PortAccess::READ_WRITE);
        assert_eq!(bus.read_u8(0x2001), 0);
    }

    #[test]
    fn unregister_device_removes_all_its_ports() {
        let mut bus = IoPortBus::new();
        let (_a, a) = latch(0x3F8);
        let (_b, b) = latch(0x2F8);
        bus.register_range(0x3F8, 4, &a, PortAccess::READ_WRITE);
        bus.register_range(0xFFF0, 4, &a, PortAccess::READ);
        bus.register(0x2F8, &b, PortAccess::READ_WRITE);

        bus.unregister_device(&a);
        for port in [0x3F8, 0x3FB, 0xFFF0] {
            assert!(bus.lookup_input(port).is_none());
            assert!(bus.lookup_output(port).is_none());
        }
        assert!(bus.lookup_input(0x2F8).is_some());
    }

    #[test]
    fn unregister_single_direction() {
        let mut bus = IoPortBus::new();
        let (_dev, shared) = latch(0x5000);
        bus.register(0x5000, &shared, PortAccess::READ_WRITE);
        bus.unregister(0x5000, PortAccess::WRITE);
        assert!(bus.lookup_input(0x5000).is_some());
        assert!(bus.lookup_output(0x5000).is_none());
    }

    #[test]
    fn reset_hits_each_device_once() {
        let mut bus = IoPortBus::new();
        let (dev, shared) = latch(0x40);
        bus.register_range(0x40, 4, &shared, PortAccess::READ_WRITE);
        bus.register(0x9000, &shared, PortAccess::READ);
        bus.write_u8(0x40, 9);

        bus.reset();
        assert_eq!(dev.borrow().resets, 1);
        assert_eq!(bus.read_u8(0x40), 0);
    }

    #[test]
    #[should_panic(expected = "wraps past 0xFFFF")]
    fn range_past_top_of_port_space_panics() {
        let mut bus = IoPortBus::new();
        let (_dev, shared) = latch(0xFFFE);
        bus.register_range(0xFFFE, 4, &shared, PortAccess::READ);
    }
}
