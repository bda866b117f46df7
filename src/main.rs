use anyhow::Result;
use clap::Parser;
use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use simplelog::*;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use hawck_input::{InputDaemon, ValidatedArgs};

#[derive(Parser, Debug)]
#[command(author, version, verbatim_doc_comment)]
/// hawck-inputd: the privileged keyboard half of Hawck
///
/// hawck-inputd grabs keyboard devices exclusively, forwards whitelisted
/// key events to the macro daemon for scripting, and emits the results on
/// a synthetic keyboard. Keys outside the passthrough whitelist are echoed
/// straight to the synthetic keyboard and never reach the scripting side.
struct Args {
    /// Keyboard device node(s) to grab. When omitted, /dev/input is
    /// scanned for devices that look like keyboards.
    #[arg(short, long, verbatim_doc_comment)]
    kbd_device: Vec<PathBuf>,

    /// Unix socket where the macro daemon listens.
    #[arg(long, default_value = "/var/lib/hawck-input/kbd.sock")]
    socket_path: PathBuf,

    /// Directory holding the passthrough whitelist CSV files.
    #[arg(long, default_value = "/var/lib/hawck-input/keys")]
    keys_dir: PathBuf,

    /// Microseconds to sleep between synthetic key events.
    ///
    /// Some compositors drop keys that are delivered less than about a
    /// millisecond apart; raise this if output sequences lose keys.
    #[arg(long, default_value_t = hawck_input::oskbd::DEFAULT_EVENT_DELAY_US, verbatim_doc_comment)]
    event_delay: u64,

    /// Milliseconds to wait for each reply from the macro daemon.
    #[arg(long, default_value_t = 1024)]
    socket_timeout: u64,

    /// Remove the startup delay.
    /// In some cases, removing the delay may cause keyboard issues on startup.
    #[arg(short, long, verbatim_doc_comment)]
    nodelay: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Enable trace logging; implies --debug as well.
    #[arg(short, long)]
    trace: bool,
}

/// Parse CLI arguments and initialize logging.
fn cli_init() -> Result<ValidatedArgs> {
    let args = Args::parse();

    let log_lvl = match (args.debug, args.trace) {
        (_, true) => LevelFilter::Trace,
        (true, false) => LevelFilter::Debug,
        (false, false) => LevelFilter::Info,
    };

    let mut log_cfg = ConfigBuilder::new();
    if let Err(e) = log_cfg.set_time_offset_to_local() {
        eprintln!("WARNING: could not set log TZ to local: {e:?}");
    };
    log_cfg.set_time_format_rfc3339();
    CombinedLogger::init(vec![TermLogger::new(
        log_lvl,
        log_cfg.build(),
        TerminalMode::Mixed,
        ColorChoice::AlwaysAnsi,
    )])
    .expect("logger can init");
    log::info!("hawck-inputd v{} starting", env!("CARGO_PKG_VERSION"));

    Ok(ValidatedArgs {
        devices: args.kbd_device,
        socket_path: args.socket_path,
        keys_dir: args.keys_dir,
        event_delay: args.event_delay,
        socket_timeout: args.socket_timeout,
        nodelay: args.nodelay,
    })
}

/// Exit cleanly on SIGTERM/SIGINT. Dropping the process closes the uinput
/// device, which makes the kernel release any keys it still considers held.
fn exit_on_signals() {
    thread::spawn(|| {
        let mut signals = Signals::new([SIGINT, SIGTERM]).expect("signal handler can register");
        for signal in &mut signals {
            info!("caught signal {signal}, shutting down");
            std::process::exit(0);
        }
    });
}

fn main_impl() -> Result<()> {
    let args = cli_init()?;
    exit_on_signals();

    let mut daemon = InputDaemon::new(&args)?;

    if !args.nodelay {
        info!("Sleeping for 2s. Please release all keys and don't press additional ones.");
        thread::sleep(Duration::from_secs(2));
    }

    daemon.run()
}

fn main() -> Result<()> {
    let ret = main_impl();
    if let Err(ref e) = ret {
        log::error!("{e:?}");
    }
    ret
}
