//! Update loop and command handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::{self, Command, HELP_TEXT};
use crate::Result;
use crate::domain::{Caller, Identity, PackId};
use crate::jobs::{CancelOutcome, JobController, JobRequest, SubmitOutcome};
use crate::telegram::types::{Message, Update};
use crate::telegram::{ChatPlatform, TelegramClient};

/// Pause after a failed poll before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Where updates come from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Block until updates newer than `offset` arrive (or the poll times out).
    async fn poll(&self, offset: i64) -> Result<Vec<Update>>;

    /// Mark everything below `offset` as consumed without waiting.
    async fn acknowledge(&self, offset: i64) -> Result<()>;
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn poll(&self, offset: i64) -> Result<Vec<Update>> {
        self.get_updates(offset).await
    }

    async fn acknowledge(&self, offset: i64) -> Result<()> {
        self.get_updates_with_timeout(offset, 0).await.map(|_| ())
    }
}

/// A `/cancel` waiting for its `y`.
#[derive(Debug, Clone, Copy)]
struct PendingCancel {
    pack_id: PackId,
    expires_at: Instant,
}

/// Routes incoming messages to the job controller.
pub struct Dispatcher {
    platform: Arc<dyn ChatPlatform>,
    controller: JobController,
    confirm_timeout: Duration,
    /// Keyed by `(chat id, identity)`.
    pending: Mutex<HashMap<(i64, Identity), PendingCancel>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        controller: JobController,
        confirm_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            platform,
            controller,
            confirm_timeout,
            pending: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Poll until `/stop` or the shutdown token fires.
    pub async fn run(&self, updates: &dyn UpdateSource) {
        let mut offset = 0i64;
        info!("Polling for updates");

        while !self.shutdown.is_cancelled() {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                batch = updates.poll(offset) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "Polling failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                    }
                }
            };

            for update in batch {
                offset = offset.max(update.update_id + 1);
                let Some(message) = update.message else {
                    continue;
                };
                if let Err(e) = self.handle_message(&message).await {
                    warn!(chat_id = message.chat.id, error = %e, "Failed to handle message");
                }
            }
        }

        // Otherwise the next start replays the last batch, `/stop` included.
        if offset > 0 {
            if let Err(e) = updates.acknowledge(offset).await {
                warn!(offset, error = %e, "Failed to acknowledge final updates");
            }
        }
        info!("Stopped polling");
    }

    pub async fn handle_message(&self, message: &Message) -> Result<()> {
        let (Some(from), Some(text)) = (&message.from, &message.text) else {
            return Ok(());
        };
        if from.is_bot {
            return Ok(());
        }

        let chat_id = message.chat.id;
        let caller = Caller::new(Identity(from.id), from.display_name());
        let pending = self.take_pending(chat_id, caller.identity);

        let Some(command) = commands::parse_command(text) else {
            if let Some(pending) = pending {
                return self.resolve_cancel(chat_id, &caller, pending, text).await;
            }
            return Ok(());
        };

        debug!(%caller.identity, chat_id, ?command, "Command received");

        match command {
            Command::Start | Command::Help => self.reply(chat_id, HELP_TEXT).await,
            Command::Create {
                pack_id,
                split_overflow,
            } => self.create(chat_id, &caller, pack_id, split_overflow).await,
            Command::Cancel { pack_id } => self.request_cancel(chat_id, &caller, pack_id).await,
            Command::Stop => self.stop(chat_id, &caller).await,
            Command::Malformed { usage } => self.reply(chat_id, usage).await,
            Command::Unknown(_) => Ok(()),
        }
    }

    async fn create(&self, chat_id: i64, caller: &Caller, pack_id: PackId, split_overflow: bool) -> Result<()> {
        let outcome = self.controller.submit(JobRequest {
            identity: caller.identity,
            pack_id,
            chat_id,
            split_overflow,
        });
        self.reply(chat_id, &submit_reply(pack_id, outcome)).await
    }

    async fn request_cancel(&self, chat_id: i64, caller: &Caller, requested: Option<PackId>) -> Result<()> {
        let Some(active) = self.controller.active_pack(caller.identity) else {
            return self.reply(chat_id, "You have no job in progress.").await;
        };
        if let Some(requested) = requested
            && requested != active
        {
            return self
                .reply(chat_id, &format!("There is no job for dccon {requested}."))
                .await;
        }

        self.pending.lock().insert(
            (chat_id, caller.identity),
            PendingCancel {
                pack_id: active,
                expires_at: Instant::now() + self.confirm_timeout,
            },
        );
        self.reply(chat_id, &format!("Cancel the job for dccon {active}? (y/n)"))
            .await
    }

    async fn resolve_cancel(&self, chat_id: i64, caller: &Caller, pending: PendingCancel, answer: &str) -> Result<()> {
        if !commands::is_confirmation(answer) {
            debug!(%caller.identity, pack_id = %pending.pack_id, "Cancel not confirmed");
            return self.reply(chat_id, "Cancel abandoned.").await;
        }

        match self.controller.cancel(caller.identity) {
            CancelOutcome::Cancelled(pack_id) => {
                self.reply(chat_id, &format!("Cancelled the job for dccon {pack_id}."))
                    .await
            }
            CancelOutcome::NoActiveJob => self.reply(chat_id, "You have no job in progress.").await,
        }
    }

    async fn stop(&self, chat_id: i64, caller: &Caller) -> Result<()> {
        let cancelled = match self.controller.cancel_all(caller) {
            Ok(cancelled) => cancelled,
            Err(_) => {
                warn!(%caller.identity, name = %caller.name, "Ignoring /stop from non-operator");
                return Ok(());
            }
        };

        info!(count = cancelled.len(), "Stopping on operator request");
        for (identity, pack_id) in &cancelled {
            self.reply(chat_id, &format!("Cancelled dccon {pack_id} of user {identity}."))
                .await?;
        }

        self.controller.wait_idle().await;
        self.reply(chat_id, "All jobs finished, shutting down.").await?;
        self.shutdown.cancel();
        Ok(())
    }

    /// Remove and return the caller's pending confirmation if it is still live.
    fn take_pending(&self, chat_id: i64, identity: Identity) -> Option<PendingCancel> {
        let mut pending = self.pending.lock();
        let now = Instant::now();
        pending.retain(|_, p| p.expires_at > now);
        pending.remove(&(chat_id, identity))
    }

    async fn reply(&self, chat_id: i64, text: &str) -> Result<()> {
        self.platform.send_message(chat_id, text).await
    }
}

/// Reply text for every admission decision.
pub fn submit_reply(pack_id: PackId, outcome: SubmitOutcome) -> String {
    match outcome {
        SubmitOutcome::Accepted => {
            format!("Converting dccon {pack_id}. The link follows when it's ready.")
        }
        SubmitOutcome::RejectedGlobalFull => {
            "Too many jobs are running right now. Try again later.".to_string()
        }
        SubmitOutcome::RejectedIdentityBusy { active } => {
            format!("You already have a job running for dccon {active}.")
        }
        SubmitOutcome::RejectedDuplicatePack { .. } => {
            format!("Dccon {pack_id} is already being converted. Try again shortly.")
        }
    }
}
