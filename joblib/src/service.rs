use crate::actors::accountant::UsageAccountantHandle;
use crate::delivery::{self, DeliveryOutcome, DeliveryPolicy, Transport};
use crate::error::Result;
use crate::executor::JobExecutor;
use crate::types::JobId;

use tokio::io::AsyncRead;
use tracing::{info, info_span, warn, Instrument};

/// Runs one submission end to end: drain, execute, account, deliver.
///
/// Cheap to clone; every clone shares the same accountant.
#[derive(Clone)]
pub struct JobService {
    executor: JobExecutor,
    accountant: UsageAccountantHandle,
    policy: DeliveryPolicy,
}

impl JobService {
    pub fn new(
        executor: JobExecutor,
        accountant: UsageAccountantHandle,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            executor,
            accountant,
            policy,
        }
    }

    pub fn accountant(&self) -> &UsageAccountantHandle {
        &self.accountant
    }

    /// Run `input` through the program on behalf of `caller` and deliver the result over
    /// `transport`.
    ///
    /// Every call is counted against the caller, including ones that fail before the program
    /// could run. Those failures are returned as errors and nothing is delivered.
    pub async fn submit<R, T>(
        &self,
        caller: &str,
        input: R,
        transport: &mut T,
    ) -> Result<DeliveryOutcome>
    where
        R: AsyncRead + Unpin,
        T: Transport + ?Sized,
    {
        let job_id: JobId = uuid::Uuid::new_v4();
        let span = info_span!("job", %job_id, caller);
        self.submit_inner(caller, input, transport)
            .instrument(span)
            .await
    }

    async fn submit_inner<R, T>(
        &self,
        caller: &str,
        input: R,
        transport: &mut T,
    ) -> Result<DeliveryOutcome>
    where
        R: AsyncRead + Unpin,
        T: Transport + ?Sized,
    {
        let input = match self.executor.drain(input).await {
            Ok(input) => input,
            Err(err) => {
                warn!(%err, "job input could not be read");
                self.accountant.record_failed_attempt(caller, 0).await?;
                return Err(err);
            }
        };
        let input_bytes = input.len() as u64;

        let result = match self.executor.run(input).await {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, input_bytes, "job failed before it could be classified");
                self.accountant
                    .record_failed_attempt(caller, input_bytes)
                    .await?;
                return Err(err);
            }
        };
        info!(
            outcome = ?result.outcome,
            input_bytes,
            output_bytes = result.output.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "job finished"
        );

        self.accountant.apply(caller, &result, input_bytes).await?;
        let delivered = delivery::deliver(&result, transport, &self.policy).await?;
        info!(?delivered, "job delivered");
        Ok(delivered)
    }
}
