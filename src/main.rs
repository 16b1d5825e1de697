use anyhow::Result;
use clap::Parser;
use rollcall_realtime::destinations::{self, ATTENDANCE_EVENTS};
use rollcall_realtime::{RealtimeConfig, RealtimeService, StompOptions, StompTransport, Unsubscribe};
use serde_json::Value;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Follow Rollcall real-time topics and log every payload
#[derive(Parser, Debug)]
#[command(name = "rollcall-realtime", version)]
struct Args {
    /// REST API base URL (overrides ROLLCALL_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token sent with the connection handshake
    #[arg(long, env = "ROLLCALL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Follow this user's notification feed
    #[arg(long)]
    user: Option<u64>,

    /// Follow live attendance for this event
    #[arg(long)]
    event: Option<u64>,

    /// Follow the global attendance topic
    #[arg(long)]
    attendance_events: bool,

    /// Any other destination (repeatable)
    #[arg(long = "destination", short = 'd')]
    destinations: Vec<String>,
}

impl Args {
    fn selected_destinations(&self) -> Vec<String> {
        let mut selected = Vec::new();
        if let Some(user) = self.user {
            selected.push(destinations::user_notifications(user));
        }
        if let Some(event) = self.event {
            selected.push(destinations::event_attendance(event));
        }
        if self.attendance_events {
            selected.push(ATTENDANCE_EVENTS.to_string());
        }
        selected.extend(self.destinations.iter().cloned());
        selected
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let mut config = RealtimeConfig::from_env()?;
    if let Some(url) = &args.api_url {
        config = config.with_api_base_url(url.clone());
    }

    let (transport, events) = StompTransport::new(StompOptions::from(&config));
    let service = Arc::new(RealtimeService::new(&config, Arc::new(transport))?);
    if !service.is_enabled() {
        warn!("Set ROLLCALL_API_URL or --api-url to enable real-time updates");
        return Ok(());
    }

    let selected = args.selected_destinations();
    if selected.is_empty() {
        warn!("No destinations selected, use --user, --event, --attendance-events or --destination");
        return Ok(());
    }

    let pump = service.clone();
    tokio::spawn(async move {
        pump.run(events).await;
    });

    let mut subscriptions: Vec<Unsubscribe> = Vec::new();
    for destination in selected {
        let topic = destination.clone();
        let sub = service.subscribe(&destination, move |payload: &Value| -> Result<()> {
            info!(destination = %topic, payload = %payload, "Update");
            Ok(())
        })?;
        info!("Following {}", destination);
        subscriptions.push(sub);
    }

    service.connect(args.token.as_deref());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }

    info!("Shutting down");
    for sub in &subscriptions {
        sub.unsubscribe();
    }
    service.disconnect();

    Ok(())
}
