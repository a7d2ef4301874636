mod actor;
mod messages;

use self::{
    actor::Accountant,
    messages::{AccountantMessage, Update},
};
use crate::error::{Error, Result};
use crate::events::JobResult;
use crate::stats::CallerStats;
use crate::store::StatsStore;
use crate::types::StatsMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A `UsageAccountant` which owns every caller's usage counters.
///
/// This struct is an actor handle. The counters live in the actor spawned by `UsageAccountant::spawn`,
/// which handles one message at a time: a caller's record is created exactly once and no two
/// updates ever interleave. After every change the whole map is handed to the `StatsStore`.
#[derive(Clone)]
pub struct UsageAccountantHandle {
    sender: mpsc::Sender<AccountantMessage>,
}

impl UsageAccountantHandle {
    /// Spawn a new accountant seeded with `stats`.
    ///
    /// `message_capacity` bounds the accountant's inbox.
    pub fn spawn(stats: StatsMap, store: Arc<dyn StatsStore>, message_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(message_capacity);
        Accountant::spawn(receiver, stats, store);
        Self { sender }
    }

    /// The caller's current counters, creating a zeroed record on first sight.
    pub async fn get_or_create(&self, caller: &str) -> Result<CallerStats> {
        self.request(|response| AccountantMessage::GetOrCreate {
            caller: caller.to_owned(),
            response,
        })
        .await
    }

    /// Account for a classified job. Returns the caller's counters after the update.
    pub async fn apply(
        &self,
        caller: &str,
        result: &JobResult,
        input_bytes: u64,
    ) -> Result<CallerStats> {
        self.update(
            caller,
            Update::Job {
                result: result.clone(),
                input_bytes,
            },
        )
        .await
    }

    /// Account for a submission that never reached a classification.
    pub async fn record_failed_attempt(
        &self,
        caller: &str,
        input_bytes: u64,
    ) -> Result<CallerStats> {
        self.update(caller, Update::FailedAttempt { input_bytes })
            .await
    }

    pub async fn record_crash(&self, caller: &str) -> Result<CallerStats> {
        self.update(caller, Update::Crash).await
    }

    pub async fn snapshot(&self) -> Result<StatsMap> {
        self.request(|response| AccountantMessage::Snapshot { response })
            .await
    }

    async fn update(&self, caller: &str, update: Update) -> Result<CallerStats> {
        self.request(|response| AccountantMessage::Update {
            caller: caller.to_owned(),
            update,
            response,
        })
        .await
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> AccountantMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| Error::AccountantStopped)?;
        rx.await.map_err(|_| Error::AccountantStopped)
    }
}
