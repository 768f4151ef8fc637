#![forbid(unsafe_code)]

// Native-only runner. Keep a stub `main` so `--target wasm32-unknown-unknown --workspace` still
// builds.
#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::{bail, Context, Result};
    use clap::Parser;
    use kiln_fiber::{BlockCache, CpuState, ExecutionContext, FiberConfig};
    use kiln_gen::{Interrupt, Reg};
    use kiln_mem::{page, page_offset, AddressSpace, PageFlags, PAGE_SIZE};
    use tracing::{debug, info};
    use tracing_subscriber::EnvFilter;

    /// Top of the initial stack; the stack grows down from here.
    const STACK_TOP: u32 = 0xc000_0000;

    #[derive(Debug, Parser)]
    #[command(
        name = "kiln",
        about = "Run a flat 32-bit x86 guest image until it raises an interrupt"
    )]
    pub struct Args {
        /// Raw guest code, loaded verbatim.
        image: PathBuf,

        /// Guest address the image is loaded at (page aligned).
        #[arg(long, default_value = "0x1000", value_parser = parse_addr)]
        load_addr: u32,

        /// Guest address execution starts at. Defaults to the load address.
        #[arg(long, value_parser = parse_addr)]
        entry: Option<u32>,

        /// Pages mapped for the initial stack below 0xc0000000. The stack may grow past them.
        #[arg(long, default_value_t = 16)]
        stack_pages: u32,

        /// Give up after this many timer interrupts.
        #[arg(long)]
        max_timer_ticks: Option<u64>,

        /// Initial block hash table size (power of two). Overrides `KILN_HASH_SIZE`.
        #[arg(long)]
        hash_size: Option<usize>,

        /// Per-context frame cache size (power of two). Overrides `KILN_FRAME_CACHE_SIZE`.
        #[arg(long)]
        frame_cache_size: Option<usize>,

        /// Block entries between timer interrupts (power of two). Overrides
        /// `KILN_TIMER_INTERVAL`.
        #[arg(long)]
        timer_interval: Option<u64>,

        /// Log filter, e.g. `kiln_fiber=trace`. Defaults to `RUST_LOG`.
        #[arg(long)]
        log: Option<String>,
    }

    fn parse_addr(s: &str) -> Result<u32, String> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse(),
        };
        parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
    }

    pub fn main() -> Result<()> {
        let args = Args::parse();
        init_logging(args.log.as_deref())?;

        let image = std::fs::read(&args.image)
            .with_context(|| format!("failed to read guest image: {}", args.image.display()))?;
        if image.is_empty() {
            bail!("guest image {} is empty", args.image.display());
        }
        if page_offset(args.load_addr) != 0 {
            bail!("load address {:#010x} is not page aligned", args.load_addr);
        }
        if args.stack_pages == 0 || args.stack_pages > page(STACK_TOP) {
            bail!("stack size of {} pages is out of range", args.stack_pages);
        }

        let config = fiber_config(&args)?;
        let space = Arc::new(AddressSpace::new());
        load_image(&space, args.load_addr, &image)?;
        space
            .map(
                page(STACK_TOP) - args.stack_pages,
                args.stack_pages,
                PageFlags::RW | PageFlags::GROWSDOWN,
            )
            .context("failed to map the stack")?;

        let cache = BlockCache::new(space, config).context("invalid block cache configuration")?;
        let mut ctx = ExecutionContext::new(cache.clone());
        let cpu = ctx.cpu_mut();
        cpu.eip = args.entry.unwrap_or(args.load_addr);
        cpu.set_reg(Reg::Esp, STACK_TOP);

        let mut ticks: u64 = 0;
        let interrupt = loop {
            let interrupt = ctx.run_to_interrupt();
            if interrupt != Interrupt::Timer {
                break Some(interrupt);
            }
            ticks += 1;
            if args.max_timer_ticks.is_some_and(|max| ticks >= max) {
                break None;
            }
        };

        let stats = cache.stats();
        debug!(
            blocks = stats.blocks,
            bytes = stats.bytes,
            hash_size = stats.hash_size,
            jetsam = stats.jetsam,
            "block cache at exit"
        );
        match interrupt {
            Some(interrupt) => println!(
                "interrupt: {interrupt:?} (code {}) after {ticks} timer ticks",
                interrupt.code()
            ),
            None => println!("stopped after {ticks} timer ticks"),
        }
        print_registers(ctx.cpu());
        Ok(())
    }

    fn init_logging(filter: Option<&str>) -> Result<()> {
        let filter = match filter {
            Some(directives) => EnvFilter::try_new(directives)
                .with_context(|| format!("invalid --log filter: {directives}"))?,
            None => EnvFilter::from_default_env(),
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    }

    fn fiber_config(args: &Args) -> Result<FiberConfig> {
        let mut config = FiberConfig::from_env().context("invalid KILN_* environment")?;
        if let Some(size) = args.hash_size {
            config.initial_hash_size = size;
        }
        if let Some(size) = args.frame_cache_size {
            config.frame_cache_size = size;
        }
        if let Some(interval) = args.timer_interval {
            config.timer_interval = interval;
        }
        config.validate()?;
        Ok(config)
    }

    fn load_image(space: &AddressSpace, load_addr: u32, image: &[u8]) -> Result<()> {
        let pages = u32::try_from(image.len().div_ceil(PAGE_SIZE as usize))
            .context("guest image does not fit in the address space")?;
        space
            .map(page(load_addr), pages, PageFlags::RWX)
            .with_context(|| format!("failed to map {pages} pages at {load_addr:#010x}"))?;
        space
            .write_bytes(load_addr, image)
            .context("failed to copy the guest image")?;
        info!(
            addr = %format_args!("{load_addr:#010x}"),
            bytes = image.len(),
            pages,
            "loaded guest image"
        );
        Ok(())
    }

    fn print_registers(cpu: &CpuState) {
        for row in Reg::ALL.chunks(4) {
            let line: Vec<String> = row
                .iter()
                .map(|&reg| format!("{}={:08x}", format!("{reg:?}").to_lowercase(), cpu.reg(reg)))
                .collect();
            println!("{}", line.join(" "));
        }
        println!("eip={:08x} eflags={:08x}", cpu.eip, cpu.eflags());
        if cpu.trapno == Some(Interrupt::Gpf) {
            println!(
                "segfault at {:08x} ({})",
                cpu.segfault_addr,
                if cpu.segfault_was_write { "write" } else { "read" }
            );
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
