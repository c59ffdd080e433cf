#![forbid(unsafe_code)]
//! A minimal PC: flat RAM, the port bus, the dual 8259 and one CPU core.
//!
//! The execution thread owns everything except the PIC pair, which is shared
//! through an `Arc` with the optional host-thread timer.

mod config;
mod memory;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use pcx86_cpu_core::interp::{self, StepOutcome};
use pcx86_cpu_core::interrupts::poll_and_deliver_external_interrupt;
use pcx86_cpu_core::{CpuExit, CpuMode, CpuState, Segment};
use pcx86_devices::debugcon::{register_debugcon, SharedDebugConLog};
use pcx86_devices::pic8259::register_pic8259;
use pcx86_devices::PeriodicTimer;
use pcx86_interrupts::{DualPic8259, IrqLine, ResetKind};
use pcx86_platform::{IoPortBus, SharedIoDevice};
use tracing::debug;

pub use config::{MachineConfig, MachineError, MAX_RAM_SIZE_BYTES};
pub use memory::{Ram, SystemBus};

/// Why [`Machine::run_slice`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The slice completed because `max_insts` was reached.
    Completed { executed: u64 },
    /// The CPU is halted and nothing is deliverable.
    Halted { executed: u64 },
    /// Execution stopped on a CPU exit condition.
    Exception { exit: CpuExit, executed: u64 },
}

impl RunExit {
    /// Number of guest instructions retired in this slice.
    pub fn executed(&self) -> u64 {
        match *self {
            RunExit::Completed { executed }
            | RunExit::Halted { executed }
            | RunExit::Exception { executed, .. } => executed,
        }
    }
}

/// Result of a single [`Machine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// One instruction retired.
    Retired,
    /// An external interrupt was delivered instead of executing an instruction.
    InterruptDelivered,
    /// The CPU is halted; nothing was executed.
    Halted,
    /// A `REP` string instruction stopped for an interrupt that was no longer
    /// deliverable at acknowledge time. It restarts on the next step.
    Restarted,
}

pub struct Machine {
    cfg: MachineConfig,
    cpu: CpuState,
    bus: SystemBus,
    pics: Arc<DualPic8259>,
    debugcon_log: SharedDebugConLog,
    /// Strong references to port devices; the bus only holds weak ones.
    _devices: Vec<SharedIoDevice>,
    timer: Option<PeriodicTimer>,
}

impl Machine {
    pub fn new(cfg: MachineConfig) -> Result<Self, MachineError> {
        cfg.validate()?;

        let ram_size = usize::try_from(cfg.ram_size_bytes)
            .map_err(|_| MachineError::RamTooLarge(cfg.ram_size_bytes))?;
        let pics = Arc::new(DualPic8259::new(
            cfg.master_vector_base,
            cfg.slave_vector_base,
        ));

        let mut io = IoPortBus::new();
        io.set_log_unmapped(cfg.log_unmapped_ports);
        let debugcon_log: SharedDebugConLog = Rc::new(RefCell::new(Vec::new()));
        let devices = vec![
            register_pic8259(&mut io, Arc::clone(&pics)),
            register_debugcon(&mut io, debugcon_log.clone()),
        ];

        let timer = match cfg.timer_period {
            Some(period) => {
                let line = IrqLine::new(Arc::clone(&pics), cfg.timer_irq)
                    .map_err(|_| MachineError::InvalidTimerIrq(cfg.timer_irq))?;
                Some(PeriodicTimer::start(line, period)?)
            }
            None => None,
        };

        debug!(
            ram_size,
            master_vector_base = cfg.master_vector_base,
            slave_vector_base = cfg.slave_vector_base,
            timer = ?cfg.timer_period,
            "machine created"
        );

        Ok(Self {
            cfg,
            cpu: CpuState::new(CpuMode::Real),
            bus: SystemBus {
                ram: Ram::new(ram_size),
                io,
            },
            pics,
            debugcon_log,
            _devices: devices,
            timer,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.cfg
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn bus_mut(&mut self) -> &mut SystemBus {
        &mut self.bus
    }

    pub fn ram(&self) -> &Ram {
        &self.bus.ram
    }

    pub fn io_mut(&mut self) -> &mut IoPortBus {
        &mut self.bus.io
    }

    /// The PIC pair. Clone the `Arc` to drive IRQ lines from another thread.
    pub fn pics(&self) -> &Arc<DualPic8259> {
        &self.pics
    }

    pub fn timer(&self) -> Option<&PeriodicTimer> {
        self.timer.as_ref()
    }

    /// Copy `image` into RAM at physical address `addr`.
    pub fn load_image(&mut self, addr: u64, image: &[u8]) -> Result<(), MachineError> {
        let ram_size = self.bus.ram.len() as u64;
        let out_of_range = || MachineError::ImageOutOfRange {
            addr,
            len: image.len(),
            ram_size,
        };
        let end = addr
            .checked_add(image.len() as u64)
            .filter(|&end| end <= ram_size)
            .ok_or_else(out_of_range)?;
        self.bus.ram.as_mut_slice()[addr as usize..end as usize].copy_from_slice(image);
        Ok(())
    }

    /// Point `CS:IP` at `cs:ip`.
    pub fn set_entry(&mut self, cs: u16, ip: u32) {
        self.cpu.load_segment(Segment::Cs, cs);
        self.cpu.set_ip(ip);
    }

    /// Drain the bytes written to the DebugCon port so far.
    pub fn take_debugcon_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut *self.debugcon_log.borrow_mut())
    }

    pub fn debugcon_output(&self) -> Vec<u8> {
        self.debugcon_log.borrow().clone()
    }

    /// Reset the CPU, the PIC pair and every port device.
    ///
    /// RAM is preserved. The timer keeps running.
    pub fn reset(&mut self, kind: ResetKind) {
        self.cpu = CpuState::new(CpuMode::Real);
        self.pics.reset(kind);
        self.bus.io.reset();
        debug!(?kind, "machine reset");
    }

    /// Advance by one instruction boundary.
    ///
    /// A deliverable interrupt is taken before fetching unless the previous
    /// instruction was an `STI` that enabled interrupts. A `REP` string
    /// instruction that stops for an interrupt has the interrupt delivered
    /// right away, with the saved `EIP` still on the instruction.
    pub fn step(&mut self) -> Result<StepExit, CpuExit> {
        let delivered =
            poll_and_deliver_external_interrupt(&mut self.cpu, &mut self.bus, &*self.pics)?;
        if delivered {
            return Ok(StepExit::InterruptDelivered);
        }
        if self.cpu.is_halted() {
            return Ok(StepExit::Halted);
        }

        match interp::step(&mut self.cpu, &mut self.bus, &*self.pics)? {
            StepOutcome::Retired | StepOutcome::Halted => Ok(StepExit::Retired),
            StepOutcome::InterruptWindow => {
                let delivered = poll_and_deliver_external_interrupt(
                    &mut self.cpu,
                    &mut self.bus,
                    &*self.pics,
                )?;
                Ok(if delivered {
                    StepExit::InterruptDelivered
                } else {
                    StepExit::Restarted
                })
            }
        }
    }

    /// Run until `max_insts` instructions have retired, the CPU halts with
    /// nothing deliverable, or a CPU exit occurs.
    ///
    /// Interrupt deliveries do not count towards `max_insts`.
    pub fn run_slice(&mut self, max_insts: u64) -> RunExit {
        let mut executed = 0u64;
        while executed < max_insts {
            match self.step() {
                Ok(StepExit::Retired) => executed += 1,
                Ok(StepExit::InterruptDelivered | StepExit::Restarted) => {}
                Ok(StepExit::Halted) => {
                    // A device thread may have raised a line since the poll.
                    if self.pics.has_deliverable() && self.cpu.rflags.interrupts_enabled() {
                        continue;
                    }
                    return RunExit::Halted { executed };
                }
                Err(exit) => return RunExit::Exception { exit, executed },
            }
        }
        RunExit::Completed { executed }
    }
}
