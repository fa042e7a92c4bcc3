//! Connects to a real-time endpoint and prints every state change.
//!
//! ```text
//! connection-probe ws://127.0.0.1:3026/socket.io [project-id]
//! ```
//!
//! Ctrl-C closes the session the way a user logging out would.

use logos_connection::{connect_ws, ConnectionConfig, ConnectionError};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let mut config = match args.next() {
        Some(endpoint) => ConnectionConfig::with_endpoint(endpoint),
        None => ConnectionConfig::default(),
    };
    config.project_id = args.next();
    if let Ok(fallback) = std::env::var("LOGOS_FALLBACK_ENDPOINT") {
        config.fallback_endpoint = Some(fallback);
    }

    log::info!("Probing {}", config.connect_url(&config.endpoint));

    let (mut driver, handle) = connect_ws(config);
    let Some(mut changes) = driver.take_state_rx() else {
        log::error!("State receiver already taken");
        return;
    };
    let task = tokio::spawn(driver.run());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(change) => {
                    let state = change.state;
                    println!(
                        "{:?} -> {:?} (error: {})",
                        change.previous_state.effective(),
                        state.effective(),
                        state.error().map_or("none", |e| e.as_str()),
                    );
                }
                None => break,
            },
            _ = &mut ctrl_c => {
                log::info!("Interrupted, closing");
                if handle.close(ConnectionError::Maintenance).is_err()
                    || handle.shutdown().is_err()
                {
                    log::warn!("Driver already stopped");
                }
                break;
            }
        }
    }

    match task.await {
        Ok(manager) => log::info!("Final stats: {:?}", manager.stats()),
        Err(e) => log::error!("Driver task failed: {e}"),
    }
}
