use anyhow::Context;
use clap::Parser;
use livetrace::{SessionOptions, SessionState, SymbolTable, TraceSession};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Count how often functions in a running process are entered.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process to attach to
    #[arg(short, long)]
    pid: i32,

    /// Main executable of the process, defaults to /proc/<pid>/exe
    #[arg(short, long)]
    exe: Option<PathBuf>,

    /// Function to count, may be given more than once
    #[arg(short, long = "symbol", required = true)]
    symbols: Vec<String>,

    /// Stop counting after this many seconds
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Don't pass signals the target receives on to it
    #[arg(long, default_value_t = false)]
    swallow_signals: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }))
    .init();

    // the link still opens after the file was replaced on disk
    let exe = args.exe.unwrap_or_else(|| PathBuf::from(format!("/proc/{}/exe", args.pid)));
    let symbols = Arc::new(SymbolTable::resolve(&exe).with_context(|| format!("loading symbols from {:?}", exe))?);
    if symbols.is_empty() {
        anyhow::bail!("{:?} has debug info but no functions in it", exe);
    }
    log::info!("{} symbols in {:?}", symbols.len(), exe);

    let options = SessionOptions {
        forward_signals: !args.swallow_signals,
        ..Default::default()
    };
    let session = TraceSession::attach_with(args.pid, &exe, Arc::clone(&symbols), options)
        .with_context(|| format!("attaching to {}", args.pid))?;

    let mut counters = Vec::new();
    for symbol in &args.symbols {
        let hits = Arc::new(AtomicU64::new(0));
        let callback_hits = Arc::clone(&hits);
        let handle = session
            .create_breakpoint(symbol, move || {
                callback_hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .with_context(|| format!("breaking on {}", symbol))?;
        println!("[*] {} at {:#x}", symbol, handle.address());
        counters.push((symbol.clone(), hits));
    }

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    while Instant::now() < deadline && session.state() != SessionState::Exited {
        thread::sleep(POLL_INTERVAL);
    }
    if session.state() == SessionState::Exited {
        println!("[*] {} exited", args.pid);
    }
    session.stop();

    for (symbol, hits) in counters {
        println!("{:>10}  {}", hits.load(Ordering::Relaxed), symbol);
    }

    Ok(())
}
