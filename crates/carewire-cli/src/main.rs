//! # carewire
//!
//! Connects as one identity and prints presence, typing and collection
//! changes until interrupted.

#![deny(unsafe_code)]

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use carewire_core::{EntityKind, Identity};
use carewire_realtime::{ConnectionHandle, ConnectionManager, ConnectionStatus, PresencePage, TypingEntry};
use clap::Parser;

/// Watch the carewire realtime channel.
#[derive(Parser, Debug)]
#[command(name = "carewire", about = "Watch carewire presence and entity updates")]
struct Cli {
    /// Identity to connect as.
    #[arg(long)]
    identity: String,

    /// Settings file (defaults to `~/.carewire/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// WebSocket endpoint (overrides settings).
    #[arg(long)]
    server_url: Option<String>,

    /// Bulk-fetch API base URL (overrides settings).
    #[arg(long)]
    api_url: Option<String>,

    /// Log level filter (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,

    /// Rooms to join once connected. Repeatable.
    #[arg(long = "room")]
    rooms: Vec<String>,

    /// How many online identities to list before summarizing the rest.
    #[arg(long, default_value = "5")]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(carewire_settings::settings_path);
    let mut settings = carewire_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    if let Some(url) = args.server_url.clone() {
        settings.realtime.server_url = url;
    }
    if let Some(url) = args.api_url.clone() {
        settings.api.base_url = url;
    }

    let level = args.log_level.as_deref().unwrap_or(&settings.logging.level);
    carewire_core::logging::init_subscriber(level);

    let manager = ConnectionManager::from_settings(&settings).context("Failed to build connection manager")?;
    let handle = manager
        .set_identity(Some(Identity::from(args.identity.as_str())))
        .context("No connection was opened")?;
    tracing::info!(
        identity = %args.identity,
        server = %settings.realtime.server_url,
        "watching realtime channel"
    );

    for kind in EntityKind::ALL {
        let mut rx = handle.subscribe_entities(kind);
        drop(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let collection = Arc::clone(&rx.borrow_and_update());
                println!("{kind}: {} records ({:?})", collection.len(), collection.status());
            }
        }));
    }

    watch(&handle, &args).await?;

    tracing::info!("Shutting down...");
    manager.close_all();
    Ok(())
}

/// Print every change until ctrl-c or the connection is closed.
async fn watch(handle: &ConnectionHandle, args: &Cli) -> Result<()> {
    let mut status = handle.subscribe_status();
    let mut presence = handle.subscribe_presence();
    let mut typing = handle.subscribe_typing();
    let mut joined = false;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for ctrl-c")?;
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = status.borrow_and_update().clone();
                println!("{}", format_status(&current));
                if current.state.is_connected() && !joined {
                    let emitter = handle.emitter();
                    for room in &args.rooms {
                        if !emitter.join_room(room.as_str()) {
                            tracing::warn!(room = %room, "failed to join room");
                        }
                    }
                    joined = true;
                }
            }
            changed = presence.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let _ = presence.borrow_and_update();
                println!("{}", format_presence(&handle.presence_list(args.limit), handle.presence_is_stale()));
            }
            changed = typing.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let entries = Arc::clone(&typing.borrow_and_update());
                for line in format_typing(&entries) {
                    println!("{line}");
                }
            }
        }
    }
}

fn format_status(status: &ConnectionStatus) -> String {
    let mut line = format!("status: {}", status.state);
    if let Some(session) = &status.session_id {
        let _ = write!(line, " session={session}");
    }
    if let Some(rtt) = status.last_rtt {
        let _ = write!(line, " rtt={}ms", rtt.as_millis());
    }
    if status.reconnect_attempt > 0 {
        let _ = write!(line, " attempt={}", status.reconnect_attempt);
    }
    line
}

fn format_presence(page: &PresencePage, stale: bool) -> String {
    let mut names: Vec<String> = page
        .entries
        .iter()
        .map(|e| {
            let initial = e.profile.initial(&e.identity).unwrap_or('?');
            let name = e.profile.display_name(&e.identity);
            format!("[{initial}] {name} ({})", e.status_label())
        })
        .collect();
    if page.remainder > 0 {
        names.push(format!("+{} more", page.remainder));
    }
    let marker = if stale { " (stale)" } else { "" };
    format!("online{marker}: {} | {}", page.total, names.join(", "))
}

fn format_typing(entries: &[TypingEntry]) -> Vec<String> {
    if entries.is_empty() {
        return vec!["typing: nobody".to_string()];
    }
    entries
        .iter()
        .map(|e| {
            format!(
                "typing: {} in {} {}",
                e.profile.display_name(&e.identity),
                e.context,
                e.context_id
            )
        })
        .collect()
}
