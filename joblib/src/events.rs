use crate::types::OutputBlob;
use std::time::Duration;

/// How a job ended. Every execution that got as far as spawning the program lands in
/// exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// Non-zero exit code. A program terminated by a signal reports the negated signal number.
    NonZeroExit { code: i32 },
    TimedOut,
}

impl JobOutcome {
    /// Whether the job counts as killed in the caller's usage.
    pub fn is_killed(&self) -> bool {
        match self {
            JobOutcome::Success => false,
            JobOutcome::NonZeroExit { .. } | JobOutcome::TimedOut => true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobResult {
    pub outcome: JobOutcome,
    /// Captured stdout. Always empty unless the outcome is `Success`.
    pub output: OutputBlob,
    pub elapsed: Duration,
}

impl JobResult {
    pub fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.elapsed.as_nanos()).unwrap_or(u64::MAX)
    }
}
