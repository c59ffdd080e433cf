//! Debug console ("DebugCon") device (I/O port `0xE9`).
//!
//! Bochs and QEMU expose a byte sink at port `0xE9`, so guests can log with a
//! single `out 0xE9, al`. Byte writes are appended to a host-visible buffer.
//! Reads return `0xE9`, which is how guests probe for the port.

use std::cell::RefCell;
use std::rc::Rc;

use pcx86_platform::io::{IoDevice, IoPortBus, PortAccess, SharedIoDevice};

pub const DEBUGCON_PORT: u16 = 0xE9;

/// Shared host-visible DebugCon output buffer.
pub type SharedDebugConLog = Rc<RefCell<Vec<u8>>>;

#[derive(Debug)]
pub struct DebugCon {
    log: SharedDebugConLog,
}

impl DebugCon {
    pub fn new(log: SharedDebugConLog) -> Self {
        Self { log }
    }
}

impl IoDevice for DebugCon {
    fn name(&self) -> &str {
        "debugcon"
    }

    fn in8(&mut self, _port: u16) -> u8 {
        DEBUGCON_PORT as u8
    }

    fn out8(&mut self, _port: u16, value: u8) {
        self.log.borrow_mut().push(value);
    }

    fn reset(&mut self) {
        self.log.borrow_mut().clear();
    }
}

/// Register a [`DebugCon`] on `bus` at [`DEBUGCON_PORT`].
///
/// The bus does not own devices: keep the returned handle alive for as long
/// as the port should stay mapped.
#[must_use = "the port is unmapped once the device handle is dropped"]
pub fn register_debugcon(bus: &mut IoPortBus, log: SharedDebugConLog) -> SharedIoDevice {
    let dev: SharedIoDevice = Rc::new(RefCell::new(DebugCon::new(log)));
    bus.register(DEBUGCON_PORT, &dev, PortAccess::READ_WRITE);
    dev
}
