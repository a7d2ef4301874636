pub mod actors;
pub mod delivery;
pub mod error;
mod events;
pub mod executor;
pub mod framing;
pub mod service;
pub mod socket;
mod stats;
pub mod store;
pub mod types;

// re-export the accountant handle as if it is the accountant itself.
pub use actors::accountant::UsageAccountantHandle as UsageAccountant;
pub use events::{JobOutcome, JobResult};
pub use service::JobService;
pub use stats::CallerStats;

#[cfg(test)]
mod tests {
    use super::*;
    use delivery::{DeliveryOutcome, DeliveryPolicy};
    use executor::{ExecutorConfig, JobExecutor};
    use std::sync::Arc;
    use store::JsonFileStore;

    #[tokio::test]
    async fn basic() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("users.json")));
        let accountant = UsageAccountant::spawn(types::StatsMap::new(), store.clone(), 8);
        let jobs = JobService::new(
            JobExecutor::new(ExecutorConfig::new("cat")),
            accountant,
            DeliveryPolicy::default(),
        );

        let mut transport = delivery::scripted::ScriptedTransport::default();
        let outcome = jobs
            .submit("alice", &b"hello world!"[..], &mut transport)
            .await
            .expect("submit");
        assert_eq!(
            outcome,
            DeliveryOutcome::Output {
                bytes: 12,
                attempts: 1
            }
        );
        assert_eq!(&transport.outputs()[0][..], b"hello world!");

        // the document on disk reflects the job as soon as it was accounted
        let persisted = store.load().await.expect("load");
        assert_eq!(persisted["alice"].executions, 1);
        assert_eq!(persisted["alice"].output_size, 12);
    }
}
