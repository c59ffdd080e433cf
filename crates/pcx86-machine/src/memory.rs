use pcx86_cpu_core::{IoBus, MemoryBus};
use pcx86_platform::IoPortBus;

/// Flat guest RAM. Reads past the end float high; writes past the end are
/// dropped.
#[derive(Debug, Clone)]
pub struct Ram {
    bytes: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl MemoryBus for Ram {
    fn read_u8(&mut self, addr: u64) -> u8 {
        usize::try_from(addr)
            .ok()
            .and_then(|a| self.bytes.get(a).copied())
            .unwrap_or(0xFF)
    }

    fn write_u8(&mut self, addr: u64, value: u8) {
        if let Some(b) = usize::try_from(addr)
            .ok()
            .and_then(|a| self.bytes.get_mut(a))
        {
            *b = value;
        }
    }
}

/// Everything the CPU core reaches: RAM plus the port bus.
pub struct SystemBus {
    pub ram: Ram,
    pub io: IoPortBus,
}

impl MemoryBus for SystemBus {
    fn read_u8(&mut self, addr: u64) -> u8 {
        self.ram.read_u8(addr)
    }

    fn write_u8(&mut self, addr: u64, value: u8) {
        self.ram.write_u8(addr, value);
    }
}

impl IoBus for SystemBus {
    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        self.io.read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.io.write(port, size, value);
    }
}
