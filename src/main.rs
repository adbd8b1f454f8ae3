/*!
 * Berth CLI - daemon entry point
 */

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use berth::audit::RunJournal;
use berth::commands;
use berth::config::BackupConfig;
use berth::core::cancel::{cancellation, CancelHandle};
use berth::core::log_sink::{LogSink, LogSinkOptions};
use berth::core::orchestrator::{run_once, Orchestrator};
use berth::core::singleton;
use berth::core::volume::VolumeEventBus;
use berth::error::{EXIT_FAILURE, EXIT_SUCCESS};
use berth::logging;

#[derive(Parser)]
#[command(name = "berth")]
#[command(version, about = "Sentinel-triggered removable-volume backup daemon", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Explicit target root, bypassing sentinel discovery
    #[arg(long = "root", value_name = "PATH")]
    root: Option<PathBuf>,

    /// Resolve the target once, run one backup, and exit
    #[arg(long)]
    once: bool,

    /// Keep watching for volume arrivals even if the config says otherwise
    #[arg(long, conflicts_with = "once")]
    watch: bool,

    /// Suppress console output
    #[arg(short = 'q', long)]
    silent: bool,

    /// Background presentation mode: no console echo (the tray lives in an
    /// external collaborator)
    #[arg(long)]
    background: bool,

    /// Forward all engine output to the log
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Destination for the config file (defaults to the user config dir)
        path: Option<PathBuf>,

        /// Source directory recorded in the starter config
        #[arg(long)]
        source: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() {
    let code = run();
    std::process::exit(code);
}

fn run() -> i32 {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init {
            path,
            source,
            force,
        }) => {
            return match commands::init::run(path, source, force) {
                Ok(written) => {
                    println!("wrote {}", written.display());
                    EXIT_SUCCESS
                }
                Err(e) => {
                    eprintln!("init failed: {:#}", e);
                    EXIT_FAILURE
                }
            };
        }
        Some(Commands::Completions { shell }) => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
            return EXIT_SUCCESS;
        }
        None => {}
    }

    let Some(config_path) = cli.config else {
        eprintln!("--config <PATH> is required (try `berth init` to create one)");
        return EXIT_FAILURE;
    };

    let mut config = match BackupConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_FAILURE;
        }
    };
    if let Some(root) = cli.root {
        config.explicit_root = Some(root);
    }
    if cli.once {
        config.stay_running = false;
    }
    if cli.watch {
        config.stay_running = true;
    }
    if cli.verbose {
        config.verbose = true;
    }

    logging::init_diagnostics(config.verbose, cli.silent);

    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        return EXIT_FAILURE;
    }

    // Per-host singleton: losing the race is a normal exit, not an error.
    let lock_path = singleton::default_lock_path();
    let _lock = match singleton::acquire(&lock_path) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::info!("another berth instance is already running, exiting");
            return EXIT_SUCCESS;
        }
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_FAILURE;
        }
    };

    let echo_console = !(cli.silent || cli.background);
    let sink = match LogSink::new(
        &config.log_file,
        LogSinkOptions {
            echo_console,
            ..LogSinkOptions::default()
        },
    ) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_FAILURE;
        }
    };
    let log = sink.handle();

    let journal = match &config.journal_file {
        Some(path) => match RunJournal::open(path) {
            Ok(journal) => Some(Arc::new(journal)),
            Err(e) => {
                eprintln!("{}", e);
                return EXIT_FAILURE;
            }
        },
        None => None,
    };

    // Keep a handle clone alive for the daemon's whole lifetime; dropping
    // the last one reads as cancellation.
    let (cancel_handle, cancel) = cancellation();
    install_signal_handlers(cancel_handle.clone());

    log.submit(&format!(
        "berth {} starting, source {}, sentinel '{}'",
        berth::VERSION,
        config.source.display(),
        config.sentinel_name
    ));
    if cli.background {
        tracing::info!("background presentation mode, console echo disabled");
    }

    let code = if config.stay_running {
        let config = Arc::new(config);
        let mut bus = VolumeEventBus::new(log.clone());
        let events = bus.events();
        bus.start();

        let mut orchestrator =
            Orchestrator::new(Arc::clone(&config), log.clone(), cancel, journal);
        orchestrator.watch(events);
        bus.stop();
        EXIT_SUCCESS
    } else {
        run_once(&config, &log, &cancel, journal.as_deref())
    };

    sink.shutdown();
    code
}

#[cfg(unix)]
fn install_signal_handlers(handle: CancelHandle) {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_signal: libc::c_int) {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(
            libc::SIGINT,
            on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    // Signal handlers may only set a flag; this thread turns the flag into
    // the cancellation everything else selects on.
    let _ = std::thread::Builder::new()
        .name("berth-signal-watch".to_string())
        .spawn(move || loop {
            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                handle.cancel();
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        });
}

#[cfg(not(unix))]
fn install_signal_handlers(_handle: CancelHandle) {}
