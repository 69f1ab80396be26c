use clap::Parser;
use page_capture::{setup_logging, validate_config, Cli, CliRunner, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;

    info!("starting page-capture v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let runner = CliRunner::new(config)?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = runner.run(args.command) => result,
        _ = shutdown_rx.recv() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    runner.service.shutdown().await;

    if let Err(err) = result {
        error!("application error: {}", err);
        std::process::exit(1);
    }

    info!("page-capture stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&content)?
    } else {
        Config::default()
    };

    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent_captures = max_concurrent;
    }
    if let Some(max_sessions) = args.max_sessions {
        config.max_concurrent_sessions = max_sessions;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    validate_config(&config)?;

    info!(
        max_concurrent_captures = config.max_concurrent_captures,
        max_concurrent_sessions = config.max_concurrent_sessions,
        "configuration loaded"
    );
    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!("failed to install SIGINT handler: {}", err);
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(());
    })
}
