//! Getting a finished job's output, or a notice explaining its absence, back to the caller.

use crate::events::{JobOutcome, JobResult};
use crate::types::OutputBlob;

use async_trait::async_trait;
use std::{fmt, time::Duration};
use tracing::{info, warn};

/// Largest output that will be transmitted.
pub const MAX_UPLOAD_SIZE: usize = 50 * 1024 * 1024;
pub const DEFAULT_DELIVERY_DEADLINE: Duration = Duration::from_secs(60);
pub const EXTENDED_DELIVERY_DEADLINE: Duration = Duration::from_secs(600);

/// Textual status sent to the caller in place of output bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    Killed { code: i32 },
    TimedOut { deadline: Duration },
    EmptyOutput,
    TooLarge { size: usize, limit: usize },
    SlowUpload,
    UploadFailed,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Killed { code } => write!(f, "Execution killed with exit code: {}", code),
            Notice::TimedOut { deadline } => write!(
                f,
                "Execution took more than {} seconds, killed",
                deadline.as_secs()
            ),
            Notice::EmptyOutput => f.write_str("Empty output. Maybe there are no prints in input?"),
            Notice::TooLarge { .. } => f.write_str("Output file too big for upload limits"),
            Notice::SlowUpload => {
                f.write_str("Network timeout hit, output upload may take a while")
            }
            Notice::UploadFailed => f.write_str(
                "The output took too long to upload, network timeout hit. \
                 The output is too big or the network too slow",
            ),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport timed out")]
    TimedOut,
    #[error("transport closed")]
    Closed,
    #[error("transport rejected the message: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Only a timeout is worth another attempt. A closed or rejecting peer stays that way.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::TimedOut)
    }
}

/// The way back to one caller.
#[async_trait]
pub trait Transport: Send {
    async fn send_notice(&mut self, notice: &Notice) -> Result<(), TransportError>;

    /// Transmit the whole output, failing with `TimedOut` if that takes longer than `deadline`.
    async fn send_output(
        &mut self,
        output: OutputBlob,
        deadline: Duration,
    ) -> Result<(), TransportError>;
}

#[derive(Clone, Copy, Debug)]
pub struct DeliveryPolicy {
    pub max_output: usize,
    pub deadline: Duration,
    pub extended_deadline: Duration,
    /// The executor's deadline, quoted in the timeout notice.
    pub job_deadline: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_output: MAX_UPLOAD_SIZE,
            deadline: DEFAULT_DELIVERY_DEADLINE,
            extended_deadline: EXTENDED_DELIVERY_DEADLINE,
            job_deadline: crate::executor::DEFAULT_DEADLINE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Output { bytes: usize, attempts: u8 },
    Notice(Notice),
    GaveUp,
}

enum Attempt {
    First,
    Retry,
    GiveUp,
}

/// Deliver `result` over `transport`.
///
/// Output goes out at most twice: once with the default deadline and, only if that attempt timed
/// out, once more with the extended deadline after warning the caller. Any other transport
/// failure ends delivery with an error.
pub async fn deliver<T>(
    result: &JobResult,
    transport: &mut T,
    policy: &DeliveryPolicy,
) -> Result<DeliveryOutcome, TransportError>
where
    T: Transport + ?Sized,
{
    let notice = match result.outcome {
        JobOutcome::NonZeroExit { code } => Some(Notice::Killed { code }),
        JobOutcome::TimedOut => Some(Notice::TimedOut {
            deadline: policy.job_deadline,
        }),
        JobOutcome::Success if result.output.is_empty() => Some(Notice::EmptyOutput),
        JobOutcome::Success if result.output.len() > policy.max_output => Some(Notice::TooLarge {
            size: result.output.len(),
            limit: policy.max_output,
        }),
        JobOutcome::Success => None,
    };
    if let Some(notice) = notice {
        transport.send_notice(&notice).await?;
        return Ok(DeliveryOutcome::Notice(notice));
    }

    let bytes = result.output.len();
    let mut attempt = Attempt::First;
    loop {
        attempt = match attempt {
            Attempt::First => {
                match transport
                    .send_output(result.output.clone(), policy.deadline)
                    .await
                {
                    Ok(()) => return Ok(DeliveryOutcome::Output { bytes, attempts: 1 }),
                    Err(err) if err.is_transient() => {
                        info!(%err, bytes, "output upload timed out, retrying");
                        Attempt::Retry
                    }
                    Err(err) => return Err(err),
                }
            }
            Attempt::Retry => {
                send_progress_notice(transport, &Notice::SlowUpload).await?;
                match transport
                    .send_output(result.output.clone(), policy.extended_deadline)
                    .await
                {
                    Ok(()) => return Ok(DeliveryOutcome::Output { bytes, attempts: 2 }),
                    Err(err) if err.is_transient() => {
                        warn!(%err, bytes, "output upload timed out again, giving up");
                        Attempt::GiveUp
                    }
                    Err(err) => return Err(err),
                }
            }
            Attempt::GiveUp => {
                send_progress_notice(transport, &Notice::UploadFailed).await?;
                return Ok(DeliveryOutcome::GaveUp);
            }
        }
    }
}

/// Notices sent while retrying go over the same slow link as the output. Losing one to a
/// timeout does not stop the retry.
async fn send_progress_notice<T>(transport: &mut T, notice: &Notice) -> Result<(), TransportError>
where
    T: Transport + ?Sized,
{
    match transport.send_notice(notice).await {
        Err(err) if err.is_transient() => {
            warn!(%err, %notice, "notice not delivered in time");
            Ok(())
        }
        sent => sent,
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::{Sent, ScriptedTransport};
    use super::*;
    use bytes::Bytes;

    fn success(output: &'static [u8]) -> JobResult {
        JobResult {
            outcome: JobOutcome::Success,
            output: Bytes::from_static(output),
            elapsed: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn output_is_sent_once() {
        let mut transport = ScriptedTransport::default();
        let outcome = deliver(&success(b"result"), &mut transport, &DeliveryPolicy::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Output {
                bytes: 6,
                attempts: 1
            }
        );
        assert_eq!(
            transport.sent,
            vec![Sent::Output(
                Bytes::from_static(b"result"),
                DEFAULT_DELIVERY_DEADLINE
            )]
        );
    }

    #[tokio::test]
    async fn failures_become_notices() {
        let policy = DeliveryPolicy::default();
        let cases = [
            (JobOutcome::NonZeroExit { code: 139 }, Notice::Killed { code: 139 }),
            (
                JobOutcome::TimedOut,
                Notice::TimedOut {
                    deadline: Duration::from_secs(30),
                },
            ),
        ];
        for (outcome, expected) in cases {
            let mut transport = ScriptedTransport::default();
            let result = JobResult {
                outcome,
                output: Bytes::new(),
                elapsed: Duration::ZERO,
            };
            let delivered = deliver(&result, &mut transport, &policy).await.unwrap();
            assert_eq!(delivered, DeliveryOutcome::Notice(expected.clone()));
            assert_eq!(transport.notices(), vec![expected]);
            assert_eq!(transport.attempts, 0);
        }
    }

    #[tokio::test]
    async fn empty_output_gets_a_notice() {
        let mut transport = ScriptedTransport::default();
        deliver(&success(b""), &mut transport, &DeliveryPolicy::default())
            .await
            .unwrap();
        assert_eq!(transport.notices(), vec![Notice::EmptyOutput]);
        assert!(transport.outputs().is_empty());
    }

    #[tokio::test]
    async fn oversized_output_is_never_sent() {
        let policy = DeliveryPolicy {
            max_output: 4,
            ..DeliveryPolicy::default()
        };
        let mut transport = ScriptedTransport::default();
        let outcome = deliver(&success(b"too long"), &mut transport, &policy)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Notice(Notice::TooLarge { size: 8, limit: 4 })
        );
        assert_eq!(transport.attempts, 0);

        // exactly at the limit still goes out
        let mut transport = ScriptedTransport::default();
        deliver(&success(b"four"), &mut transport, &policy)
            .await
            .unwrap();
        assert_eq!(transport.outputs(), vec![Bytes::from_static(b"four")]);
    }

    #[tokio::test]
    async fn timeout_is_retried_with_extended_deadline() {
        let mut transport = ScriptedTransport::failing([TransportError::TimedOut]);
        let outcome = deliver(&success(b"slow"), &mut transport, &DeliveryPolicy::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Output {
                bytes: 4,
                attempts: 2
            }
        );
        assert_eq!(
            transport.sent,
            vec![
                Sent::Notice(Notice::SlowUpload),
                Sent::Output(Bytes::from_static(b"slow"), EXTENDED_DELIVERY_DEADLINE),
            ]
        );
    }

    #[tokio::test]
    async fn second_timeout_gives_up() {
        let mut transport =
            ScriptedTransport::failing([TransportError::TimedOut, TransportError::TimedOut]);
        let outcome = deliver(&success(b"slow"), &mut transport, &DeliveryPolicy::default())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::GaveUp);
        assert_eq!(transport.attempts, 2);
        assert_eq!(
            transport.notices(),
            vec![Notice::SlowUpload, Notice::UploadFailed]
        );
    }

    #[tokio::test]
    async fn stalled_notices_do_not_stop_the_retry() {
        let mut transport =
            ScriptedTransport::failing([TransportError::TimedOut, TransportError::TimedOut])
                .failing_notices([TransportError::TimedOut, TransportError::TimedOut]);
        let outcome = deliver(&success(b"slow"), &mut transport, &DeliveryPolicy::default())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::GaveUp);
        assert_eq!(transport.attempts, 2);
        assert!(transport.sent.is_empty());
    }

    #[tokio::test]
    async fn lost_slow_upload_notice_still_retries() {
        let mut transport = ScriptedTransport::failing([TransportError::TimedOut])
            .failing_notices([TransportError::TimedOut]);
        let outcome = deliver(&success(b"slow"), &mut transport, &DeliveryPolicy::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Output {
                bytes: 4,
                attempts: 2
            }
        );
        assert_eq!(
            transport.sent,
            vec![Sent::Output(
                Bytes::from_static(b"slow"),
                EXTENDED_DELIVERY_DEADLINE
            )]
        );
    }

    #[tokio::test]
    async fn closed_notice_channel_ends_delivery() {
        let mut transport = ScriptedTransport::failing([TransportError::TimedOut])
            .failing_notices([TransportError::Closed]);
        let err = deliver(&success(b"slow"), &mut transport, &DeliveryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
        assert_eq!(transport.attempts, 1);
    }

    #[tokio::test]
    async fn closed_transport_is_not_retried() {
        let mut transport = ScriptedTransport::failing([TransportError::Closed]);
        let err = deliver(&success(b"gone"), &mut transport, &DeliveryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
        assert_eq!(transport.attempts, 1);
        assert!(transport.notices().is_empty());
    }

    #[test]
    fn notice_wording() {
        assert_eq!(
            Notice::Killed { code: 1 }.to_string(),
            "Execution killed with exit code: 1"
        );
        assert_eq!(
            Notice::TimedOut {
                deadline: Duration::from_secs(30)
            }
            .to_string(),
            "Execution took more than 30 seconds, killed"
        );
        assert_eq!(
            Notice::UploadFailed.to_string(),
            "The output took too long to upload, network timeout hit. \
             The output is too big or the network too slow"
        );
    }
}
