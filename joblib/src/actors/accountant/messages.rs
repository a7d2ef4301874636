use crate::events::JobResult;
use crate::stats::CallerStats;
use crate::types::{CallerId, StatsMap};
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum AccountantMessage {
    GetOrCreate {
        caller: CallerId,
        response: oneshot::Sender<CallerStats>,
    },
    Update {
        caller: CallerId,
        update: Update,
        response: oneshot::Sender<CallerStats>,
    },
    Snapshot {
        response: oneshot::Sender<StatsMap>,
    },
}

#[derive(Debug)]
pub enum Update {
    Job {
        result: JobResult,
        input_bytes: u64,
    },
    FailedAttempt {
        input_bytes: u64,
    },
    Crash,
}

impl Update {
    pub fn apply_to(&self, stats: &mut CallerStats) {
        match self {
            Update::Job {
                result,
                input_bytes,
            } => stats.record_job(result, *input_bytes),
            Update::FailedAttempt { input_bytes } => stats.record_failed_attempt(*input_bytes),
            Update::Crash => stats.record_crash(),
        }
    }
}
