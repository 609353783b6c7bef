use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::{self, Instant, Interval};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dashboard::config::Config;
use dashboard::session::Session;
use dashboard::subscription::{SubscriptionEvent, SubscriptionHub};
use dashboard::views::{DeviceDetailView, FleetView};

const USAGE: &str = "usage: dashboard [send <device_id> <COMMAND> [params-json]]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dashboard=info")))
        .init();

    let config = Config::load()?;
    info!(api_url = %config.api_url, ws_url = %config.ws_url, farm_id = ?config.farm_id, "Dashboard starting");

    let token = config.auth_token.clone().context("AUTH_TOKEN is not set")?;
    let session = Session::login(token, None);
    debug!(user = ?session.user(), "Session started");

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => {
            let farm_id = config.farm_id.clone().context("FARM_ID is not set")?;
            follow(&config, session, &farm_id).await
        }
        Some("send") => send_command(&config, session, &args[1..]).await,
        Some(_) => bail!(USAGE),
    }
}

async fn send_command(config: &Config, session: Session, args: &[String]) -> Result<()> {
    let [device_id, command, rest @ ..] = args else {
        bail!(USAGE);
    };
    let params: Value = match rest.first() {
        Some(raw) => serde_json::from_str(raw).context("params must be a JSON object")?,
        None => json!({}),
    };

    let dispatcher = SubscriptionHub::new(config, session)?.dispatcher();
    dispatcher.send(device_id, command, &params).await?;
    info!(device_id = %device_id, command = %command, "Command accepted for delivery");
    Ok(())
}

async fn follow(config: &Config, session: Session, farm_id: &str) -> Result<()> {
    let mut hub = SubscriptionHub::new(config, session)?;

    if let Some(device_id) = config.device_id.as_deref() {
        match hub.loader().fetch_device_stats(device_id).await {
            Ok(stats) => info!(device_id, stats = ?stats, "Device 24h stats"),
            Err(e) => warn!(device_id, error = %e, "Failed to fetch device stats"),
        }
    }

    let subscription = hub.attach(farm_id)?;
    let mut fleet = FleetView::attach(subscription.store_mut(), Vec::new());
    let mut detail = match config.device_id.as_deref() {
        Some(device_id) => {
            subscription.request_device_history(device_id);
            Some(DeviceDetailView::attach(
                subscription.store_mut(),
                device_id,
                config.online_threshold_secs,
            ))
        }
        None => None,
    };

    let mut refresh = match (&detail, config.history_refresh_secs) {
        (Some(_), secs) if secs > 0 => {
            let period = Duration::from_secs(secs);
            Some(time::interval_at(Instant::now() + period, period))
        }
        _ => None,
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut signed_out = false;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            _ = tick(&mut refresh) => {
                if let Some(view) = &detail {
                    subscription.request_device_history(view.device_id());
                }
            }
            event = subscription.next_event() => {
                let Some(event) = event else {
                    warn!(farm_id, "Farm subscription ended");
                    break;
                };
                if !handle_event(farm_id, event) {
                    signed_out = true;
                    break;
                }
            }
        }

        let store = subscription.store();
        let now = Utc::now();
        if fleet.poll_changed() {
            info!(
                farm_id,
                devices = fleet.rows(store).len(),
                online = fleet.online_count(store, now, config.online_threshold_secs),
                connected = subscription.is_connected(),
                "Fleet updated"
            );
        }
        if let Some(view) = detail.as_mut() {
            if view.poll_changed() {
                if let Some(sample) = view.current(store) {
                    let stats = view.window_stats(store);
                    info!(
                        device_id = view.device_id(),
                        ts = %sample.timestamp,
                        temp_c = ?sample.measurements.temp_c,
                        hum_pct = ?sample.measurements.hum_pct,
                        online = view.is_online(store, now),
                        uptime = ?view.uptime_label(store),
                        window = stats.samples,
                        temp_range = ?stats.temp_c,
                        "Device updated"
                    );
                }
            }
        }
    }

    drop(fleet);
    drop(detail);
    if signed_out {
        let user = hub.logout().await;
        warn!(user = ?user.map(|u| u.email), "Signed out after credential rejection");
    } else {
        hub.shutdown().await;
    }
    Ok(())
}

/// Logs one subscription event. Returns `false` when following should stop.
fn handle_event(farm_id: &str, event: SubscriptionEvent) -> bool {
    match event {
        SubscriptionEvent::Connected => info!(farm_id, "Live"),
        SubscriptionEvent::Disconnected { error, retry_in } => {
            warn!(farm_id, error = %error, retry_in = ?retry_in, "Offline, showing last known state")
        }
        SubscriptionEvent::Reconnecting { attempt } => info!(farm_id, attempt, "Reconnecting"),
        SubscriptionEvent::Telemetry { device_id, appended } => debug!(farm_id, device_id = %device_id, appended, "Telemetry"),
        SubscriptionEvent::Ignored { kind } => debug!(farm_id, kind = %kind, "Ignored message"),
        SubscriptionEvent::Seeded { target, devices } => info!(farm_id, target = ?target, devices, "Seeded"),
        SubscriptionEvent::SeedFailed { target, error } => {
            if error.is_auth_rejection() {
                error!(farm_id, error = %error, "Credential rejected, signing out");
                return false;
            }
            warn!(farm_id, target = ?target, error = %error, "History unavailable")
        }
    }
    true
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
