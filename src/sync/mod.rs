//! The sync engine: a single cooperative dispatch loop.
//!
//! Each tick re-establishes the remote session if needed, drains one action
//! from the queue (pending first, then backed-off failures) and runs the
//! matching handler. Handlers never throw across the loop boundary: every
//! failure is recorded on the action and the loop continues.

mod pull;
mod push;

use crate::cache::ContentCache;
use crate::config::SyncConfig;
use crate::object::DRIVE_ROOT_ID;
use crate::remote::{RemoteDrive, RemoteError, DRIVE_ROOT_CLOUD_ID};
use crate::store::{Action, ActionKind, Direction, FailOutcome, Intent, Store};
use crate::util;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};

/// What one loop iteration did; drives the sleep between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Worked,
    Idle,
    Disconnected,
}

pub struct SyncEngine {
    store: Store,
    cache: ContentCache,
    remote: Box<dyn RemoteDrive>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        cache: ContentCache,
        remote: Box<dyn RemoteDrive>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            cache,
            remote,
            config,
        }
    }

    /// Seed the initial metadata pull and dispatch until `running` drops.
    pub fn run(&mut self, running: &AtomicBool) {
        if let Err(err) = self.store.enqueue(Intent::list_children(DRIVE_ROOT_ID)) {
            log::error!("Cannot seed initial drive listing: {}", err);
        }
        log::info!("Sync engine started");
        while running.load(Ordering::SeqCst) {
            match self.tick() {
                Tick::Worked => {}
                Tick::Idle => std::thread::sleep(self.config.idle_delay),
                Tick::Disconnected => std::thread::sleep(self.config.reconnect_delay),
            }
        }
        log::info!("Sync engine stopped");
    }

    /// One dispatch step. Public so tests can drive the engine without the
    /// timing loop.
    pub fn tick(&mut self) -> Tick {
        if !self.remote.is_healthy() {
            match self.remote.connect() {
                Ok(()) => log::info!("Remote session established"),
                Err(err) => {
                    log::debug!("Remote session unavailable: {}", err);
                    return Tick::Disconnected;
                }
            }
        }

        let action = match self
            .store
            .next_action(util::unix_now(), self.config.base_backoff.as_secs() as i64)
        {
            Ok(Some(action)) => action,
            Ok(None) => return Tick::Idle,
            Err(err) => {
                log::error!("Queue selection failed: {}", err);
                return Tick::Idle;
            }
        };

        let kind = action.kind.as_str();
        let target = action.target_id.clone();
        match self.dispatch(&action) {
            Ok(()) => {
                if let Err(err) = self.store.complete_action(action.id) {
                    log::error!("Cannot complete action {}: {}", action.id, err);
                }
            }
            Err(err) => {
                let transient = is_transient_failure(&err);
                log::warn!(
                    "{} on {} failed{}: {:#}",
                    kind,
                    target,
                    if transient { " (transient)" } else { "" },
                    err
                );
                match self.store.fail_action(
                    action.id,
                    &target,
                    &format!("{:#}", err),
                    transient,
                    self.config.max_retries,
                ) {
                    Ok(FailOutcome::Requeued) => {
                        // network fault: drop the session so the next tick
                        // reconnects before retrying
                        self.remote.disconnect();
                        return Tick::Disconnected;
                    }
                    Ok(FailOutcome::GaveUp) => {
                        log::error!(
                            "Giving up on {} for {} after {} retries",
                            kind,
                            target,
                            self.config.max_retries
                        );
                    }
                    Ok(FailOutcome::RetryScheduled) => {}
                    Err(db_err) => log::error!("Cannot record failure: {}", db_err),
                }
            }
        }
        Tick::Worked
    }

    fn dispatch(&mut self, action: &Action) -> Result<()> {
        log::debug!(
            "Dispatching {} {} on {}",
            action.direction.as_str(),
            action.kind.as_str(),
            action.target_id
        );
        match (action.direction, action.kind) {
            (Direction::Push, ActionKind::Upload) => self.handle_upload(action),
            (Direction::Push, ActionKind::UpdateContent) => self.handle_update_content(action),
            (Direction::Push, ActionKind::Rename) => self.handle_rename(action),
            (Direction::Push, ActionKind::Move) => self.handle_move(action),
            (Direction::Push, ActionKind::Delete) => self.handle_delete(action),
            (Direction::Pull, ActionKind::ListChildren) => self.handle_list_children(action),
            (Direction::Pull, ActionKind::Download) => self.handle_download(action),
            (Direction::Pull, ActionKind::EnsureLatest) => self.handle_ensure_latest(action),
            (Direction::Pull, ActionKind::DownloadChunk) => self.handle_download_chunk(action),
            (direction, kind) => {
                log::warn!(
                    "Dropping malformed action {} {} on {}",
                    direction.as_str(),
                    kind.as_str(),
                    action.target_id
                );
                Ok(())
            }
        }
    }

    /// Resolve a local id to its cloud id, substituting the drive-root
    /// sentinel.
    pub(crate) fn resolve_cloud_id(&self, local_id: &str) -> Result<Option<String>> {
        if local_id == DRIVE_ROOT_ID {
            return Ok(Some(DRIVE_ROOT_CLOUD_ID.to_owned()));
        }
        Ok(self.store.object(local_id)?.and_then(|obj| obj.cloud.id))
    }
}

/// Message-marker classification of handler failures; transient faults
/// reset the action with no backoff and force a session rebuild.
fn is_transient_failure(err: &anyhow::Error) -> bool {
    if let Some(remote) = err.downcast_ref::<RemoteError>() {
        return remote.is_transient();
    }
    const MARKERS: &[&str] = &["connection", "timeout", "timed out", "503", "409", "socket"];
    let msg = format!("{:#}", err).to_ascii_lowercase();
    MARKERS.iter().any(|m| msg.contains(m))
}
