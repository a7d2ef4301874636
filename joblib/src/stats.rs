use crate::events::JobResult;
use serde::{Deserialize, Serialize};

/// Usage counters for a single caller.
///
/// Counters only ever grow. They saturate instead of wrapping, so a record loaded from a
/// hand-edited document can never move backwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerStats {
    // declared in key order, persisted documents list them the same way
    pub crashes: u64,
    pub executions: u64,
    pub executions_killed: u64,
    pub input_size: u64,
    pub output_size: u64,
    /// Nanoseconds spent inside the executor.
    pub processing_time: u64,
}

impl CallerStats {
    /// Account for a job that reached a terminal classification.
    pub fn record_job(&mut self, result: &JobResult, input_bytes: u64) {
        self.executions = self.executions.saturating_add(1);
        self.input_size = self.input_size.saturating_add(input_bytes);
        self.processing_time = self.processing_time.saturating_add(result.elapsed_nanos());
        if result.outcome.is_killed() {
            self.executions_killed = self.executions_killed.saturating_add(1);
        } else {
            self.output_size = self
                .output_size
                .saturating_add(result.output.len() as u64);
        }
    }

    /// Account for a submission that failed before the program could be classified.
    pub fn record_failed_attempt(&mut self, input_bytes: u64) {
        self.executions = self.executions.saturating_add(1);
        self.input_size = self.input_size.saturating_add(input_bytes);
    }

    pub fn record_crash(&mut self) {
        self.crashes = self.crashes.saturating_add(1);
    }
}
