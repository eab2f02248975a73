use clap::Parser;
use color_eyre::eyre::{self, Result, WrapErr};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;
use tracing::{self as log};

use blaster_core::{
    run_flywheel_task, BlasterConfig, ControlLoopScheduler, FlywheelController,
    FlywheelEventQueue, FlywheelIntent, FlywheelSnapshot, InputFrame, OutputFrame, TokioClock,
};

mod codec;
mod io_board;

/// How long a Ctrl-C waits for the flywheels to spin down before the outputs
/// are forced off.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const IO_BOARD_BAUD_RATE: u32 = 115_200;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Path of the serial device of the I/O board. Without it, runs with no
    /// hardware attached.
    #[arg(long)]
    io_board: Option<String>,

    /// Filename of blaster configuration in YAML format
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for log files. Defaults to the home directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand, Default)]
enum Commands {
    /// Run the control loop (default command)
    #[default]
    Run,
    /// Show the configuration and then quit
    ShowConfig,
}

fn load_config(path: Option<&Path>) -> Result<BlasterConfig> {
    let cfg = if let Some(path) = path {
        log::info!("Reading config from: {}", path.display());
        let cfg_buf = std::fs::read_to_string(path)
            .with_context(|| format!("opening file {}", path.display()))?;
        serde_yaml::from_str(&cfg_buf)
            .with_context(|| format!("while parsing YAML in file {}", path.display()))?
    } else {
        log::info!("Loading default config.");
        BlasterConfig::default()
    };
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn init_logging(log_dir: &Path) -> Result<()> {
    use time::{format_description::well_known::Iso8601, UtcOffset};
    use tracing_subscriber::{
        fmt::{self, time::OffsetTime},
        layer::SubscriberExt,
    };

    let log_file_name = chrono::Local::now()
        .format(".blaster-%Y%m%d_%H%M%S.%f.log")
        .to_string();
    let full_log_file_name = log_dir.join(log_file_name);

    // Create a fixed offset time formatter based on the timezone at the
    // time this line of code runs.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file = std::fs::File::create(&full_log_file_name)
        .with_context(|| format!("While creating file {}", full_log_file_name.display()))?;
    let file_writer = Mutex::new(file);
    let file_layer = fmt::layer()
        .with_timer(timer.clone())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true);
    let console_layer = fmt::layer()
        .with_timer(timer)
        .with_file(true)
        .with_line_number(true);
    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(collector)?;
    std::panic::set_hook(Box::new(tracing_panic::panic_hook));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        let envstr = format!("{}=info,info", env!("CARGO_PKG_NAME"));
        std::env::set_var("RUST_LOG", envstr);
    }

    let cli = Cli::parse();
    let log_dir = match cli.log_dir {
        Some(dir) => dir,
        None => home::home_dir().ok_or_else(|| eyre::eyre!("could not find home directory"))?,
    };
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("While creating directory {}", log_dir.display()))?;
    init_logging(&log_dir)?;
    log::info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let cfg = load_config(cli.config.as_deref())?;
    let cfg_pretty = serde_yaml::to_string(&cfg)?;
    log::info!("blaster config:\n{cfg_pretty}");

    match cli.command {
        Some(Commands::ShowConfig) => {
            return Ok(());
        }
        Some(Commands::Run) | None => {} // continue
    };

    run(cfg, cli.io_board).await
}

async fn run(cfg: BlasterConfig, io_board_path: Option<String>) -> Result<()> {
    let clock = Arc::new(TokioClock::new());
    let queue = Arc::new(FlywheelEventQueue::new());

    let (snapshot_tx, mut snapshot_rx) = watch::channel(FlywheelSnapshot::default());
    let (inputs_tx, inputs_rx) = watch::channel(InputFrame::default());
    let (outputs_tx, outputs_rx) = watch::channel(OutputFrame::default());
    let (rpm_tx, rpm_rx) = watch::channel(None);

    // Launch task to run serial IO with the board
    let mut io_task = if let Some(path) = io_board_path {
        let serial_device = tokio_serial::new(&path, IO_BOARD_BAUD_RATE)
            .open_native_async()
            .with_context(|| format!("Failed to open I/O board serial device {path}"))?;
        tokio::spawn(io_board::run_io_board_loop(
            serial_device,
            outputs_rx,
            inputs_tx,
            rpm_tx,
        ))
    } else {
        log::warn!("No I/O board specified, dry run with all switches released.");
        drop((inputs_tx, rpm_tx));
        tokio::spawn(io_board::run_dry_run_loop(outputs_rx))
    };

    let flywheel_task = tokio::spawn(run_flywheel_task(
        FlywheelController::new(&cfg),
        queue.clone(),
        snapshot_tx,
        clock.clone(),
        rpm_rx,
    ));

    let mut scheduler = ControlLoopScheduler::new(
        &cfg,
        clock,
        inputs_rx,
        queue.clone(),
        snapshot_rx.clone(),
        outputs_tx,
    );
    log::info!("control loop running, period {:?}", scheduler.period());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Main loop.
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                log::info!("shutdown requested, spinning down flywheels");
                break;
            }
            io_result = &mut io_task => {
                io_result??;
                eyre::bail!("I/O task ended unexpectedly");
            }
            _ = scheduler.tick() => {}
        }
    }

    queue.post(FlywheelIntent::Spindown);
    let spun_down = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        loop {
            scheduler.tick().await;
            if snapshot_rx.borrow_and_update().is_at_rest() {
                break;
            }
        }
    })
    .await;
    if spun_down.is_err() {
        log::warn!("flywheels not at rest after {SHUTDOWN_TIMEOUT:?}, forcing outputs off");
    }
    scheduler.stop_outputs();
    if scheduler.total_overruns() > 0 {
        log::info!("{} control loop overrun(s) in total", scheduler.total_overruns());
    }

    // Closing the output channel lets the I/O task deliver the final frame
    // and return.
    drop(scheduler);
    match tokio::time::timeout(Duration::from_secs(1), io_task).await {
        Ok(io_result) => io_result??,
        Err(_) => log::warn!("I/O task did not finish"),
    }
    flywheel_task.abort();
    log::info!("stopped");
    Ok(())
}
