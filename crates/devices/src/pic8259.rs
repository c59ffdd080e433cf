//! I/O port wiring for the dual 8259 PIC.
//!
//! The controller model lives in `pcx86-interrupts` and is shared with device
//! threads through an `Arc`. This module puts its four ports on an
//! [`IoPortBus`] and turns guest protocol errors into log lines.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use pcx86_platform::io::{IoDevice, IoPortBus, PortAccess, SharedIoDevice};
use tracing::warn;

pub use pcx86_interrupts::pic8259::{
    DualPic8259, MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA,
};

/// Port view of a shared [`DualPic8259`].
#[derive(Debug, Clone)]
pub struct PicPorts {
    pics: Arc<DualPic8259>,
}

impl PicPorts {
    pub fn new(pics: Arc<DualPic8259>) -> Self {
        Self { pics }
    }

    pub fn pics(&self) -> &Arc<DualPic8259> {
        &self.pics
    }
}

impl IoDevice for PicPorts {
    fn name(&self) -> &str {
        "pic8259"
    }

    fn in8(&mut self, port: u16) -> u8 {
        self.pics.port_read_u8(port).unwrap_or_else(|err| {
            warn!(port, %err, "PIC read ignored");
            0xFF
        })
    }

    fn out8(&mut self, port: u16, value: u8) {
        if let Err(err) = self.pics.port_write_u8(port, value) {
            warn!(port, value, %err, "PIC command ignored");
        }
    }
}

/// Register the master (`0x20`/`0x21`) and slave (`0xA0`/`0xA1`) ports.
///
/// Keep the returned handle alive for as long as the ports should stay mapped.
#[must_use = "the ports are unmapped once the device handle is dropped"]
pub fn register_pic8259(bus: &mut IoPortBus, pics: Arc<DualPic8259>) -> SharedIoDevice {
    let dev: SharedIoDevice = Rc::new(RefCell::new(PicPorts::new(pics)));
    for port in [MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA] {
        bus.register(port, &dev, PortAccess::READ_WRITE);
    }
    dev
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_pics() -> (IoPortBus, Arc<DualPic8259>, SharedIoDevice) {
        let pics = Arc::new(DualPic8259::default());
        let mut bus = IoPortBus::new();
        let dev = register_pic8259(&mut bus, pics.clone());
        (bus, pics, dev)
    }

    #[test]
    fn bios_init_sequence_over_ports() {
        let (mut bus, pics, _dev) = bus_with_pics();
        for (port, value) in [
            (MASTER_CMD, 0x11),
            (MASTER_DATA, 0x08),
            (MASTER_DATA, 0x04),
            (MASTER_DATA, 0x01),
            (SLAVE_CMD, 0x11),
            (SLAVE_DATA, 0x70),
            (SLAVE_DATA, 0x02),
            (SLAVE_DATA, 0x01),
            (MASTER_DATA, 0xFB),
            (SLAVE_DATA, 0xFF),
        ] {
            bus.write_u8(port, value);
        }
        assert_eq!(bus.read_u8(MASTER_DATA), 0xFB);
        assert_eq!(bus.read_u8(SLAVE_DATA), 0xFF);
        assert_eq!(pics.master().vector_base(), 0x08);
        assert_eq!(pics.slave().vector_base(), 0x70);
    }

    #[test]
    fn irr_and_isr_reads() {
        let (mut bus, pics, _dev) = bus_with_pics();
        pics.raise_irq(1);
        assert_eq!(bus.read_u8(MASTER_CMD), 0x02);
        assert_eq!(pics.service(), Some(0x09));

        bus.write_u8(MASTER_CMD, 0x0B);
        assert_eq!(bus.read_u8(MASTER_CMD), 0x02);
        bus.write_u8(MASTER_CMD, 0x20);
        assert_eq!(bus.read_u8(MASTER_CMD), 0x00);
    }

    #[test]
    fn guest_protocol_errors_are_ignored() {
        let (mut bus, pics, _dev) = bus_with_pics();
        pics.raise_irq(0);

        // Nothing in service yet, then poll mode, then an unsupported OCW2.
        bus.write_u8(MASTER_CMD, 0x20);
        bus.write_u8(MASTER_CMD, 0x0C);
        bus.write_u8(MASTER_CMD, 0xE0);

        assert_eq!(pics.master().request(), 0x01);
        assert_eq!(pics.service(), Some(0x08));
    }

    #[test]
    fn ports_unmap_with_the_device() {
        let (mut bus, _pics, dev) = bus_with_pics();
        drop(dev);
        assert_eq!(bus.read_u8(MASTER_DATA), 0xFF);
        assert!(bus.lookup_output(SLAVE_CMD).is_none());
    }
}
