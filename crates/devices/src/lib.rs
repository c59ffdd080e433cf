#![forbid(unsafe_code)]

pub mod debugcon;
pub mod pic8259;
pub mod timer;

pub use debugcon::DebugCon;
pub use pic8259::PicPorts;
pub use timer::PeriodicTimer;
