use application::SwarmApp;
use config::Config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from environment variables
    let config = Config::from_env(None)?;

    // Initialize tracing, RUST_LOG wins over LOG_FILTER
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        data_dir = %config.data_dir.display(),
        completion_db = %config.completion_db.display(),
        max_conns = config.established_conns_per_torrent,
        "starting pacswarm"
    );

    let seed_path = config.seed_path.clone();
    let app = SwarmApp::open(config)?;

    let torrent = match seed_path {
        Some(path) => {
            let torrent = app.seed_file(&path).await?;
            let snapshot = torrent.handle.snapshot();
            info!(
                info_hash = %snapshot.info_hash,
                complete = snapshot.stats.pieces_complete,
                pieces = snapshot.pieces.len(),
                "seeding {}",
                path.display()
            );
            for line in snapshot.status().lines() {
                info!("{}", line);
            }
            Some(torrent)
        }
        None => {
            warn!("SEED_PATH not set, nothing to serve");
            None
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some(torrent) = torrent {
        torrent.handle.close().await?;
        torrent.task.await?;
    }
    Ok(())
}
