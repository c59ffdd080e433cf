#![forbid(unsafe_code)]
//! CPU-side half of the interrupt path: architectural state, the bus traits
//! the core executes against, hardware/software interrupt entry, and the
//! string-instruction driver that keeps `REP` prefixes restartable.
//!
//! The decoder here only understands what interrupt handlers and string
//! loops need; general-purpose ALU opcodes are out of scope.

pub mod interp;
pub mod interrupts;
pub mod mem;
pub mod state;

pub use interrupts::{CpuExit, InterruptController, InterruptSource};
pub use mem::{CpuBus, IoBus, MemoryBus};
pub use state::{CpuMode, CpuState, RFlags, RunState, Segment};
