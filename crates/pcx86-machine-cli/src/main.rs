#![forbid(unsafe_code)]

// Native-only runner; keep a stub so `--target wasm32-unknown-unknown` workspace builds pass.
#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::fs::{self, File};
    use std::io::{self, BufWriter, Write};
    use std::path::PathBuf;
    use std::time::Duration;

    use anyhow::{bail, Context, Result};
    use clap::Parser;
    use pcx86_machine::{Machine, MachineConfig, RunExit};

    const SLICE_INST_BUDGET: u64 = 100_000;

    /// How long to sleep while a halted guest waits for the timer thread.
    const HALT_IDLE: Duration = Duration::from_micros(100);

    #[derive(Debug, Parser)]
    #[command(about = "Run a flat real-mode binary on the pcx86 machine")]
    pub struct Args {
        /// Flat binary image loaded at `--load-addr`.
        image: PathBuf,

        /// Guest RAM size in KiB.
        #[arg(long, default_value_t = 1024)]
        ram_kib: u64,

        /// Physical load address of the image (decimal or 0x-prefixed hex).
        #[arg(long, default_value = "0x7c00", value_parser = parse_u64)]
        load_addr: u64,

        /// Initial `CS:IP`, both in hex.
        #[arg(long, default_value = "0000:7c00", value_parser = parse_entry)]
        entry: (u16, u32),

        /// Stop after executing at most N guest instructions.
        #[arg(long, default_value_t = 10_000_000)]
        max_insts: u64,

        /// Raise IRQ0 from a host timer thread every N microseconds.
        #[arg(long)]
        timer_us: Option<u64>,

        /// Where to write DebugCon output bytes (I/O port `0xE9`).
        ///
        /// `stdout` (default), `none`, or a file path.
        #[arg(long, default_value = "stdout")]
        debugcon_out: String,

        /// Log every access to an unmapped I/O port.
        #[arg(long)]
        log_unmapped: bool,
    }

    pub fn parse_u64(s: &str) -> Result<u64, String> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        };
        parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
    }

    pub fn parse_entry(s: &str) -> Result<(u16, u32), String> {
        let (cs, ip) = s
            .split_once(':')
            .ok_or_else(|| format!("expected CS:IP, got {s:?}"))?;
        let cs = u16::from_str_radix(cs, 16).map_err(|e| format!("invalid CS {cs:?}: {e}"))?;
        let ip = u32::from_str_radix(ip, 16).map_err(|e| format!("invalid IP {ip:?}: {e}"))?;
        if ip > 0xFFFF {
            return Err(format!("IP {ip:#x} does not fit in 16 bits"));
        }
        Ok((cs, ip))
    }

    impl Args {
        fn machine_config(&self) -> Result<MachineConfig> {
            let ram_size_bytes = self
                .ram_kib
                .checked_mul(1024)
                .context("RAM size overflow")?;
            Ok(MachineConfig {
                ram_size_bytes,
                timer_period: self.timer_us.map(Duration::from_micros),
                log_unmapped_ports: self.log_unmapped,
                ..MachineConfig::default()
            })
        }
    }

    pub fn main() -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(io::stderr)
            .init();

        let args = Args::parse();

        let image = fs::read(&args.image)
            .with_context(|| format!("failed to read image: {}", args.image.display()))?;
        let mut machine =
            Machine::new(args.machine_config()?).context("failed to create machine")?;
        machine
            .load_image(args.load_addr, &image)
            .context("failed to load image")?;
        let (cs, ip) = args.entry;
        machine.set_entry(cs, ip);

        let mut debugcon_sink = open_optional_sink(&args.debugcon_out)?;
        let mut total_executed: u64 = 0;

        while total_executed < args.max_insts {
            let budget = (args.max_insts - total_executed).min(SLICE_INST_BUDGET);
            let exit = machine.run_slice(budget);
            total_executed = total_executed.saturating_add(exit.executed());
            if let Some(out) = debugcon_sink.as_mut() {
                stream_debugcon(&mut machine, out)?;
            }

            match exit {
                RunExit::Completed { .. } => {}
                RunExit::Halted { .. } => {
                    let can_wake =
                        machine.timer().is_some() && machine.cpu().rflags.interrupts_enabled();
                    if !can_wake {
                        eprintln!("guest halted after {total_executed} instructions");
                        break;
                    }
                    std::thread::sleep(HALT_IDLE);
                }
                RunExit::Exception { exit, .. } => {
                    bail!("execution stopped after {total_executed} instructions: {exit}")
                }
            }
        }

        if let Some(out) = debugcon_sink.as_mut() {
            stream_debugcon(&mut machine, out)?;
            out.flush()?;
        }
        tracing::info!(total_executed, "run finished");
        Ok(())
    }

    fn open_optional_sink(dest: &str) -> Result<Option<Box<dyn Write>>> {
        match dest {
            "none" => Ok(None),
            "stdout" => Ok(Some(Box::new(io::stdout()))),
            path => {
                let f = File::create(path)
                    .with_context(|| format!("failed to create DebugCon output file: {path}"))?;
                Ok(Some(Box::new(BufWriter::new(f))))
            }
        }
    }

    fn stream_debugcon(machine: &mut Machine, out: &mut dyn Write) -> Result<()> {
        let bytes = machine.take_debugcon_output();
        if !bytes.is_empty() {
            out.write_all(&bytes)?;
        }
        Ok(())
    }

}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
