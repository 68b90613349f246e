//! Polygate - a multi-protocol forward proxy

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use polygate::config::Config;
use polygate::error::Result;
use polygate::server::Instance;

fn main() {
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("main: failed to set tracing subscriber");
        std::process::exit(1);
    }

    if let Err(e) = run() {
        eprintln!("main: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let confpath = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&confpath)?;
    info!("main: load: {}", confpath);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut instance = Instance::from_config(&config)?;
        instance.init().await?;

        let shutdown = instance.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("main: shutting down");
                shutdown.cancel();
            }
        });

        instance.serve().await
    })?;

    info!("main: bye");
    Ok(())
}
