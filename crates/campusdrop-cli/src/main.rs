// Campus challenge sync entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, stdout carries the countdown)
// 2. Load config
// 3. Build the directory client and shared clock
// 4. Init the sync session
// 5. Join the push feed and start the fallback poller
// 6. Render the countdown until Ctrl+C
// 7. Dispose the session

mod countdown;

use std::sync::Arc;

use anyhow::Context;
use campusdrop_core::clock::ClockService;
use campusdrop_core::config;
use campusdrop_core::directory::HttpDirectory;
use campusdrop_core::protocol::JoinParams;
use campusdrop_core::session::{ChallengeSync, SyncSettings};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("campusdrop starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        campus = %config.session.campus_id,
        transport = %config.server.transport,
        poll_secs = config.poller.interval_secs,
        "config loaded"
    );
    if config.credentials.token().is_none() {
        info!("no auth token configured, connecting anonymously");
    }

    // 3. Directory client and clock
    let directory = Arc::new(HttpDirectory::from_config(&config));
    let clock = Arc::new(ClockService::new());

    // 4. Sync session
    let sync = ChallengeSync::init(SyncSettings::from_config(&config), directory, clock.clone());

    // 5. Push feed and poller
    let params = JoinParams::new(&config.session.campus_id, &config.session.user_id);
    sync.connect(params)
        .await
        .context("failed to start push channel")?;
    sync.start_polling()
        .await
        .context("failed to start fallback poller")?;

    // 6. Countdown until Ctrl+C
    let mut stdout = std::io::stdout();
    tokio::select! {
        result = countdown::run(sync.subscribe(), clock, &mut stdout) => {
            if let Err(e) = result {
                error!("countdown error: {e:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
        }
    }
    println!();

    // 7. Cleanup
    sync.dispose().await;
    info!("campusdrop shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to a file (stdout is used for the countdown).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("campusdrop.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("campusdrop=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
