//! `bookingsd`: owns the booking store for one data directory.
//!
//! On start it replays the WAL, seeds the configured rooms into an empty
//! store, and creates the configured admin account if no user has that
//! email. It then runs WAL compaction and session sweeping in the
//! background until SIGTERM or ctrl-c, and compacts once more on the way
//! out. The availability, reservation, calendar and auth engines are
//! library types; a front-end embeds them over the same `Store`.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::info;

use bookings::auth::Authenticator;
use bookings::availability::AvailabilityEngine;
use bookings::config::Config;
use bookings::model::UserProfile;
use bookings::session::SessionStore;
use bookings::store::Store;
use bookings::upkeep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    bookings::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(Store::open_with_timeout(config.wal_path(), config.query_timeout)?);
    if store.room_count() == 0 {
        for name in &config.rooms {
            store.insert_room(name).await?;
        }
    }

    let sessions = Arc::new(SessionStore::new(config.session_lifetime));
    if let (Some(email), Some(password)) = (&config.admin_email, &config.admin_password)
        && store.user_by_email(email).await?.is_none()
    {
        let auth = Authenticator::new(store.clone(), sessions.clone());
        let profile = UserProfile {
            first_name: "Admin".into(),
            last_name: String::new(),
            email: email.clone(),
            access_level: 3,
        };
        let id = auth.register(profile, password).await?;
        info!(user_id = id, "admin account created");
    }

    tokio::spawn(upkeep::run_compactor(store.clone(), config.compact_threshold));
    tokio::spawn(upkeep::run_session_sweeper(sessions.clone()));

    let today = Utc::now().date_naive();
    let free_tonight = AvailabilityEngine::new(store.clone())
        .search_all_rooms(today, today + TimeDelta::days(1))
        .await?;
    let pending = store.new_reservations().await?;
    let metrics = config
        .metrics_port
        .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"));
    info!("bookingsd ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  rooms: {} ({} free tonight)", store.room_count(), free_tonight.len());
    info!("  users: {}", store.user_count());
    info!("  unprocessed reservations: {}", pending.len());
    info!("  query_timeout: {:?}", store.query_timeout());
    info!("  metrics: {metrics}");

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");

    if let Err(e) = store.compact_wal().await {
        tracing::error!("final WAL compaction failed: {e}");
    }
    info!("bookingsd stopped");
    Ok(())
}
