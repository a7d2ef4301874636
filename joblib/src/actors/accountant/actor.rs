use super::messages::AccountantMessage;
use crate::store::StatsStore;
use crate::types::StatsMap;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct Accountant {
    inbox: mpsc::Receiver<AccountantMessage>,
    stats: StatsMap,
    store: Arc<dyn StatsStore>,
}

impl Accountant {
    pub fn spawn(
        inbox: mpsc::Receiver<AccountantMessage>,
        stats: StatsMap,
        store: Arc<dyn StatsStore>,
    ) {
        let actor = Self {
            inbox,
            stats,
            store,
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        use self::AccountantMessage::*;
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                GetOrCreate { caller, response } => {
                    let created = !self.stats.contains_key(&caller);
                    let stats = *self.stats.entry(caller).or_default();
                    if created {
                        self.persist().await;
                    }
                    let _ = response.send(stats);
                }
                Update {
                    caller,
                    update,
                    response,
                } => {
                    let stats = self.stats.entry(caller).or_default();
                    update.apply_to(stats);
                    let stats = *stats;
                    self.persist().await;
                    let _ = response.send(stats);
                }
                Snapshot { response } => {
                    let _ = response.send(self.stats.clone());
                }
            }
        }
        debug!("all accountant handles dropped, stopping");
    }

    async fn persist(&self) {
        if let Err(err) = self.store.save(&self.stats).await {
            // the in-memory map stays authoritative, the next save rewrites everything
            warn!(%err, "failed to persist usage stats");
        }
    }
}
