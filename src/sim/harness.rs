//! CLI entry point for the simulation harness: runs a synthetic print job end to end
//! against the simulated firmware and projector, and logs every print event as JSON.

use clap::Parser;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::Level;
use vatprint_rs::config::{Config, load_config};
use vatprint_rs::print::PrintEvent;
use vatprint_rs::print_job::{LayerEntry, LayerManifest, PrintJob};
use vatprint_rs::printer::Printer;

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Runs a synthetic print job against the simulated printer.")]
pub struct Cli {
    /// Path to a TOML config file (overrides defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the event log here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of base layers
    #[arg(long, default_value_t = 2)]
    base: usize,

    /// Number of body layers
    #[arg(long, default_value_t = 3)]
    body: usize,

    /// Tiled elements per layer
    #[arg(long, default_value_t = 1)]
    tiles: usize,

    /// Enable the pump maneuver between layers
    #[arg(long)]
    pump: bool,

    /// Abort when this layer starts
    #[arg(long)]
    abort_at: Option<usize>,

    /// Pause when this layer starts, then resume once paused
    #[arg(long)]
    pause_at: Option<usize>,

    /// Make the simulated firmware fail the n-th linear move
    #[arg(long)]
    fail_after: Option<usize>,

    /// Shrink every delay and move time
    #[arg(long)]
    fast: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn write_layers(dir: &Path, name: &str, layers: usize, tiles: usize, thickness_um: u32) -> std::io::Result<LayerManifest> {
    let directory = dir.join(name);
    std::fs::create_dir_all(&directory)?;
    let mut entries = Vec::with_capacity(layers * tiles);
    for layer in 0..layers {
        for tile in 0..tiles {
            let file_name = format!("{:04}_{}.png", layer, tile);
            std::fs::write(directory.join(&file_name), b"layer")?;
            entries.push(LayerEntry {
                file_name,
                thickness_um,
                exposure_time_s: None,
            });
        }
    }
    Ok(LayerManifest {
        directory,
        entries,
        elements_per_layer: tiles,
    })
}

fn build_job(cli: &Cli, dir: &Path) -> std::io::Result<PrintJob> {
    let base = match cli.base {
        0 => None,
        n => Some(write_layers(dir, "base", n, cli.tiles, 100)?),
    };
    let body = write_layers(dir, "body", cli.body, cli.tiles, 50)?;
    let mut job = PrintJob::new(base, body);
    for params in [&mut job.base_parameters, &mut job.body_parameters] {
        params.pumping_enabled = cli.pump;
        if cli.fast {
            params.layer_exposure_time_ms = 20;
            params.pump_up_pause_ms = 10;
            params.pump_down_pause_ms = 10;
            params.tiling_default_exposure_s = 0.02;
            params.tiling_exposure_step_s = 0.01;
        }
    }
    Ok(job)
}

fn apply_overrides(cli: &Cli, config: &mut Config) {
    config.firmware.simulate = true;
    config.projector.simulate = true;
    config.display.require_images = true;
    config.firmware.simulator.fail_on_move = cli.fail_after;
    if cli.fast {
        config.firmware.simulator.boot_delay_ms = 5;
        config.firmware.simulator.move_time_scale = 0.001;
        config.timing.pause_after_solution_dispensed_ms = 20;
        config.timing.pause_before_project_ms = 20;
        config.timing.pause_before_lift_ms = 20;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match &cli.config {
        Some(path) => load_config(&path.to_string_lossy())?,
        None => Config::default(),
    };
    apply_overrides(&cli, &mut config);

    let layers = TempDir::new()?;
    let job = build_job(&cli, layers.path())?;
    let mut log: Box<dyn Write + Send> = match &cli.output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(std::io::stdout()),
    };

    let printer = Printer::new(config).await?;
    let print = printer.print().clone();
    let mut events = print.subscribe();
    let job_id = print.print(job).await?;
    tracing::info!("Started simulated job {}", job_id);

    let mut success = false;
    let mut abort_sent = false;
    let mut pause_sent = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged, {} events skipped", n);
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        writeln!(log, "{}", serde_json::to_string(&event)?)?;

        match event {
            PrintEvent::RequestDispensePrintSolution => print.solution_dispensed().await?,
            PrintEvent::StartingLayer(layer) if Some(layer) == cli.abort_at && !abort_sent => {
                abort_sent = true;
                print.abort().await?;
            }
            PrintEvent::StartingLayer(layer) if Some(layer) == cli.pause_at && !pause_sent => {
                pause_sent = true;
                print.pause().await?;
            }
            PrintEvent::PrintPaused => print.resume().await?,
            PrintEvent::PrintComplete(ok) => {
                success = ok;
                break;
            }
            PrintEvent::PrintAborted => break,
            _ => {}
        }
    }
    log.flush()?;
    printer.shutdown().await;

    if success {
        tracing::info!("Simulated print finished successfully");
        Ok(())
    } else {
        Err("simulated print did not complete successfully".into())
    }
}
