use std::time::Duration;

use pcx86_interrupts::pic8259::{
    CASCADE_LINE, DEFAULT_MASTER_VECTOR_BASE, DEFAULT_SLAVE_VECTOR_BASE,
};
use thiserror::Error;

/// Largest RAM the flat 32-bit physical address space can hold.
pub const MAX_RAM_SIZE_BYTES: u64 = 1 << 32;

/// Errors returned when constructing or configuring a [`crate::Machine`].
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("guest RAM size must be non-zero")]
    ZeroRam,

    #[error("guest RAM size {0:#x} exceeds the 4 GiB physical address space")]
    RamTooLarge(u64),

    #[error("timer period must be non-zero")]
    ZeroTimerPeriod,

    #[error("timer IRQ line {0} is not a device line (0..=15, excluding the cascade line 2)")]
    InvalidTimerIrq(u8),

    #[error("image of {len} bytes at {addr:#x} does not fit in {ram_size:#x} bytes of RAM")]
    ImageOutOfRange { addr: u64, len: usize, ram_size: u64 },

    #[error("failed to start the timer thread")]
    TimerThread(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Guest RAM size in bytes.
    pub ram_size_bytes: u64,
    /// Power-on vector base of the master PIC (IRQ0..7). The BIOS default is
    /// `0x08`; guests usually reprogram it.
    pub master_vector_base: u8,
    /// Power-on vector base of the slave PIC (IRQ8..15).
    pub slave_vector_base: u8,
    /// Period of the host-thread timer, or `None` for no timer.
    pub timer_period: Option<Duration>,
    /// IRQ line the timer raises.
    pub timer_irq: u8,
    /// Log every access to an unmapped I/O port.
    pub log_unmapped_ports: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size_bytes: 1024 * 1024,
            master_vector_base: DEFAULT_MASTER_VECTOR_BASE,
            slave_vector_base: DEFAULT_SLAVE_VECTOR_BASE,
            timer_period: None,
            timer_irq: 0,
            log_unmapped_ports: false,
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.ram_size_bytes == 0 {
            return Err(MachineError::ZeroRam);
        }
        if self.ram_size_bytes > MAX_RAM_SIZE_BYTES {
            return Err(MachineError::RamTooLarge(self.ram_size_bytes));
        }
        if self.timer_period.is_some_and(|p| p.is_zero()) {
            return Err(MachineError::ZeroTimerPeriod);
        }
        if self.timer_irq > 15 || self.timer_irq == CASCADE_LINE {
            return Err(MachineError::InvalidTimerIrq(self.timer_irq));
        }
        Ok(())
    }
}
