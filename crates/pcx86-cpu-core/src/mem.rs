//! Buses the CPU core executes against.

/// Linear-address memory access.
///
/// Only byte access is required; wider accesses default to little-endian
/// composition so simple RAM models stay short.
pub trait MemoryBus {
    fn read_u8(&mut self, addr: u64) -> u8;
    fn write_u8(&mut self, addr: u64, value: u8);

    fn read_u16(&mut self, addr: u64) -> u16 {
        let lo = self.read_u8(addr);
        let hi = self.read_u8(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    fn read_u32(&mut self, addr: u64) -> u32 {
        let lo = self.read_u16(addr);
        let hi = self.read_u16(addr.wrapping_add(2));
        u32::from(lo) | (u32::from(hi) << 16)
    }

    fn write_u16(&mut self, addr: u64, value: u16) {
        let [b0, b1] = value.to_le_bytes();
        self.write_u8(addr, b0);
        self.write_u8(addr.wrapping_add(1), b1);
    }

    fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_u16(addr, value as u16);
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16);
    }
}

/// Port-mapped I/O as seen from `IN`/`OUT`/`INS`/`OUTS`.
///
/// `size` is the access width in bytes (1, 2 or 4).
pub trait IoBus {
    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, value: u32);
}

pub trait CpuBus: MemoryBus + IoBus {}

impl<T: MemoryBus + IoBus + ?Sized> CpuBus for T {}

pub(crate) fn read_sized<B: MemoryBus + ?Sized>(bus: &mut B, addr: u64, size: usize) -> u32 {
    match size {
        1 => u32::from(bus.read_u8(addr)),
        2 => u32::from(bus.read_u16(addr)),
        4 => bus.read_u32(addr),
        _ => panic!("unsupported element size: {size}"),
    }
}

pub(crate) fn write_sized<B: MemoryBus + ?Sized>(bus: &mut B, addr: u64, size: usize, value: u32) {
    match size {
        1 => bus.write_u8(addr, value as u8),
        2 => bus.write_u16(addr, value as u16),
        4 => bus.write_u32(addr, value),
        _ => panic!("unsupported element size: {size}"),
    }
}
