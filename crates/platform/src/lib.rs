#![forbid(unsafe_code)]

pub mod io;

pub use io::{IoDevice, IoPortBus, PortAccess, SharedIoDevice};
