//! Command-line frontend: run scans, move single axes, identify devices.

use anyhow::{Context, Result};
use apt_scan::config::{AxisConfig, DeviceConfig, ScanConfig};
use apt_scan::instrument::{Kpz101, Ksg101};
use apt_scan::measure::SimulatedSource;
use apt_scan::scan::{
    Axis, AxisCalibration, ClosedLoopAxis, ScanEvent, ScanOrchestrator, ScanOutcome,
};
use apt_scan::storage::CsvSink;
use apt_scan::transport::{AptTransport, SerialTransport};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "apt-scan", version, about = "Closed-loop piezo raster scans over the Thorlabs APT protocol")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "scan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the raster scan described by the configuration
    Run {
        /// Result CSV path; defaults to a timestamped file in output_dir
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Converge one axis to a target position and report the final reading
    Move {
        #[arg(value_enum)]
        axis: AxisArg,
        /// Target position in micrometers
        target_um: f64,
    },
    /// Blink the front panel LED of one device
    Identify {
        #[arg(value_enum)]
        device: DeviceArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AxisArg {
    X,
    Y,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    XController,
    XGauge,
    YController,
    YGauge,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ScanConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Command::Run { output } => run_scan(config, output).await,
        Command::Move { axis, target_um } => move_axis(config, axis, target_um).await,
        Command::Identify { device } => identify(config, device).await,
    }
}

fn open_transport(device: &DeviceConfig) -> Result<Box<dyn AptTransport>> {
    Ok(Box::new(SerialTransport::open(&device.port, device.baud_rate)?))
}

async fn build_axis(axis: Axis, config: &AxisConfig) -> Result<ClosedLoopAxis> {
    let mut kpz = Kpz101::new(
        config.controller.name.clone(),
        open_transport(&config.controller)?,
        config.controller.mode,
        config.controller.voltage_limit,
        config.controller.feedback,
    );
    kpz.connect().await?;
    let ksg = Ksg101::new(config.gauge.name.clone(), open_transport(&config.gauge)?);
    Ok(ClosedLoopAxis::new(axis, kpz, ksg, AxisCalibration::default())?)
}

async fn run_scan(config: ScanConfig, output: Option<PathBuf>) -> Result<()> {
    let x = build_axis(Axis::X, &config.x).await?;
    let y = build_axis(Axis::Y, &config.y).await?;
    let sink = match output {
        Some(path) => CsvSink::new(path),
        None => CsvSink::timestamped_in(&config.output_dir),
    };
    println!("recording to {}", sink.path().display());

    // Simulated detector until a real acquisition frontend is wired in.
    let source = SimulatedSource::default();

    let orchestrator = ScanOrchestrator::new(
        config.scan.clone(),
        x,
        y,
        Box::new(source),
        Box::new(sink),
    )?;
    let mut handle = orchestrator.start();

    let control = handle.control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("stop requested, finishing the current move");
            control.request_stop();
        }
    });

    while let Some(event) = handle.events.recv().await {
        match event {
            ScanEvent::Convergence {
                axis,
                reading,
                iteration,
            } => log::debug!("[{axis}] iteration {iteration}: {reading} counts"),
            ScanEvent::CellMeasured(r) => println!(
                "[{}, {}] x={:.2} um y={:.2} um value={:.3}",
                r.col, r.row, r.target_x_um, r.target_y_um, r.value
            ),
            ScanEvent::Finished(ScanOutcome::Completed) => println!("scan completed"),
            ScanEvent::Finished(ScanOutcome::Aborted) => println!("scan aborted"),
        }
    }

    handle.join().await?;
    Ok(())
}

async fn move_axis(config: ScanConfig, axis: AxisArg, target_um: f64) -> Result<()> {
    let (axis, axis_config) = match axis {
        AxisArg::X => (Axis::X, &config.x),
        AxisArg::Y => (Axis::Y, &config.y),
    };
    let mut controller = build_axis(axis, axis_config).await?;

    controller.enable_output().await?;
    controller.zero_sensor().await?;

    let mut observer = |reading: i16, iteration: u32| {
        println!("iteration {iteration}: {reading} counts");
    };
    let result = controller
        .move_to(target_um, &config.scan.convergence, &mut observer)
        .await;

    let last_voltage = controller.last_voltage();
    controller.disable_output().await?;
    let reading = result?;
    println!(
        "final reading: {reading} counts ({target_um:.2} um target), output was at {last_voltage:.2} V"
    );
    Ok(())
}

async fn identify(config: ScanConfig, device: DeviceArg) -> Result<()> {
    let device_config = match device {
        DeviceArg::XController => &config.x.controller,
        DeviceArg::XGauge => &config.x.gauge,
        DeviceArg::YController => &config.y.controller,
        DeviceArg::YGauge => &config.y.gauge,
    };
    println!("identifying {} ({})", device_config.name, device_config.serial);
    match device {
        DeviceArg::XController | DeviceArg::YController => {
            let mut kpz = Kpz101::new(
                device_config.name.clone(),
                open_transport(device_config)?,
                device_config.mode,
                device_config.voltage_limit,
                device_config.feedback,
            );
            kpz.identify().await?;
        }
        DeviceArg::XGauge | DeviceArg::YGauge => {
            let mut ksg = Ksg101::new(device_config.name.clone(), open_transport(device_config)?);
            ksg.identify().await?;
        }
    }
    Ok(())
}
