//! Periodic interrupt source running on its own host thread.
//!
//! Unlike port-mapped devices, this one never touches the I/O bus: it only
//! raises its IRQ line, asynchronously to the execution thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcx86_interrupts::IrqLine;
use tracing::debug;

/// Raises `line` every `period` until stopped or dropped.
#[derive(Debug)]
pub struct PeriodicTimer {
    line: u8,
    ticks: Arc<AtomicU64>,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn start(line: IrqLine, period: Duration) -> std::io::Result<Self> {
        let irq = line.line();
        let ticks = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name(format!("pcx86-timer-irq{irq}"))
            .spawn({
                let ticks = Arc::clone(&ticks);
                move || loop {
                    match shutdown_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            line.raise();
                            ticks.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        debug!(irq, ?period, "periodic timer started");
        Ok(Self {
            line: irq,
            ticks,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn line(&self) -> u8 {
        self.line
    }

    /// Number of times the line has been raised so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it to exit. Returns the final tick count.
    pub fn stop(mut self) -> u64 {
        self.shutdown();
        self.ticks()
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!(irq = self.line, ticks = self.ticks(), "periodic timer stopped");
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
