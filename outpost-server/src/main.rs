use std::sync::Arc;

use clap::Parser;
use outpost_core::{OutpostConfig, SessionManager};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use outpost_server::dispatcher::{CommandDispatcher, EchoDispatcher};
use outpost_server::listeners::{ListenerKind, ListenerRegistry};
use outpost_server::subsystems::sweep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "outpost.toml")]
    config: String,

    /// Print the resolved configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config; a missing file means defaults
    let config = match OutpostConfig::load_or_default(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging: RUST_LOG wins, otherwise the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.as_str()));
    fmt().with_env_filter(filter).init();

    if args.check {
        println!("{:#?}", config);
        return Ok(());
    }

    let sessions = Arc::new(SessionManager::new());
    let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(EchoDispatcher);

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Idle session sweep
    tokio::spawn(sweep::run_sweep_loop(
        Arc::clone(&sessions),
        config.sweep.clone(),
        tx.subscribe(),
    ));

    let mut registry = ListenerRegistry::new(
        config.tcp.clone(),
        config.http.clone(),
        Arc::clone(&sessions),
        dispatcher,
    );

    let enabled = [
        (ListenerKind::Tcp, config.tcp.enabled),
        (ListenerKind::Http, config.http.enabled),
    ];
    for (kind, _) in enabled.iter().filter(|(_, on)| *on) {
        // A listener that fails to bind is reported; the others still start
        if let Err(e) = registry.start(*kind).await {
            tracing::error!("{}", e);
        }
    }

    if registry.active().is_empty() {
        anyhow::bail!("no listeners running; check the [tcp] and [http] sections of {}", args.config);
    }

    let mut shutdown = tx.subscribe();
    let _ = shutdown.recv().await;

    registry.stop_all().await;
    tracing::info!("{} session(s) dropped at shutdown", sessions.len());

    Ok(())
}
