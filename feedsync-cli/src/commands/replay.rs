//! Replays a recorded change feed through a conversation session.

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use engine::{EngineUpdate, Item, MemoryBackend, SubscriptionStatus, SyncEngine, UnreadState};
use serde::Serialize;
use shared::{RawChange, SyncConfig};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::timeout,
};
use tracing::info;
use uuid::Uuid;

const FEED_READY_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);
const BATCH: usize = 256;

/// Inputs of the `replay` subcommand.
#[derive(Debug, Clone)]
pub struct ReplayArgs {
    pub viewer: Uuid,
    pub peer: Uuid,
    pub file: PathBuf,
    pub mark_read: bool,
}

/// What the viewer would see after the replay.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub topic: String,
    pub published: usize,
    pub items: Vec<Item>,
    pub unread: UnreadState,
}

/// Parses newline-delimited raw changes, skipping blank lines.
///
/// # Errors
/// Names the first line that is not a JSON object.
pub fn read_changes(content: &str) -> Result<Vec<RawChange>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("line {} is not a JSON change", index + 1))
        })
        .collect()
}

/// Feeds every change in `args.file` to a fresh in-memory session.
///
/// # Errors
/// Fails when the file cannot be read or parsed, or the feed never opens.
pub async fn replay(args: &ReplayArgs, config: &SyncConfig) -> Result<ReplayReport> {
    let content = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let changes = read_changes(&content)?;

    let backend = Arc::new(MemoryBackend::new());
    let engine = SyncEngine::in_memory(args.viewer, &backend, config);
    let session = engine
        .open_conversation(args.peer)
        .await
        .context("failed to open conversation")?;
    session.set_focused(false);

    let mut status = session.status_receiver();
    let ready = timeout(
        FEED_READY_TIMEOUT,
        status.wait_for(|status| *status == SubscriptionStatus::Active),
    )
    .await
    .context("feed did not become active")?
    .is_ok();
    if !ready {
        bail!("feed closed before becoming active");
    }

    info!(topic = %session.topic(), changes = changes.len(), "replaying change log");
    let published = changes.len();
    let mut updates = engine.updates();
    for batch in changes.chunks(BATCH) {
        for change in batch {
            backend.publish(change.clone());
        }
        wait_until_quiet(&mut updates).await;
    }

    if args.mark_read {
        session.mark_read();
    }
    let report = ReplayReport {
        topic: session.topic().key(),
        published,
        items: session.snapshot(),
        unread: session.unread(),
    };
    engine.shutdown();
    Ok(report)
}

/// Returns once no update has arrived for [`QUIET_PERIOD`].
async fn wait_until_quiet(updates: &mut broadcast::Receiver<EngineUpdate>) {
    loop {
        match timeout(QUIET_PERIOD, updates.recv()).await {
            Ok(Ok(_) | Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) | Err(_) => return,
        }
    }
}
