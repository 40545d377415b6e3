// src/main.rs - Print host: builds the printer from configuration and serves the web API
use clap::Parser;
use tracing::Level;
use vatprint_rs::config;
use vatprint_rs::printer::Printer;
use vatprint_rs::web;

#[derive(Parser, Debug)]
#[command(name = "printer-host", version, about = "Resin printer print-process host")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "printer.toml")]
    config: String,

    /// Use the simulated firmware and projector
    #[arg(long)]
    simulate: bool,

    /// Override the web API bind address
    #[arg(long)]
    bind: Option<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    // Initialize logging
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting vatprint-rs print host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loading configuration from: {}", cli.config);

    let mut config = config::load_config(&cli.config).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", cli.config, e);
        tracing::error!("Please ensure the configuration file exists and is properly formatted");
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;
    if cli.simulate {
        config.firmware.simulate = true;
        config.projector.simulate = true;
    }
    if let Some(bind) = cli.bind {
        config.web.bind = bind;
    }

    tracing::info!(
        "Z limits: maximum {} mm, raise-to {} mm, slow below +{} mm",
        config.motion.maximum_z,
        config.motion.raise_to_maximum_z,
        config.motion.high_speed_threshold_z
    );
    let bind = config.web.bind.clone();

    let printer = match Printer::new(config).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("Failed to initialize printer: {}", e);
            return Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>);
        }
    };

    let app = web::api::create_router(web::api::AppState {
        print: printer.print().clone(),
        link: printer.link().clone(),
    });

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    printer.shutdown().await;
    Ok(())
}
