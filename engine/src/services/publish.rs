use bytes::Bytes;
use sift_protocol::message::{self, Rule};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::storage::StoreCache;

use super::train::RuleUpdate;

/// Fans best-rule updates from every handler into the publish/subscribe
/// egress. Updates are consumed in FIFO order; the bounded inbound channel
/// is where back-pressure reaches the handlers.
#[derive(Debug)]
pub struct RulePublisher {
    cache: StoreCache,
    feed: broadcast::Sender<Bytes>,
}

impl RulePublisher {
    pub fn new(cache: StoreCache, feed: broadcast::Sender<Bytes>) -> Self {
        Self { cache, feed }
    }

    pub async fn run(self, mut updates: mpsc::Receiver<RuleUpdate>) {
        while let Some(update) = updates.recv().await {
            let Some(rule) = self.rule_for(&update) else {
                continue;
            };
            match rule.encode() {
                Ok(frame) => {
                    debug!(
                        path = update.path,
                        index = update.candidate.index,
                        require_forbid = rule.require_forbid,
                        "publishing rule"
                    );
                    // No subscribers is fine; the feed is fire-and-forget.
                    let _ = self.feed.send(frame);
                }
                Err(error) => {
                    warn!(path = update.path, %error, "failed to encode rule");
                }
            }
        }
    }

    /// Resolves the candidate's stored sequence bytes through the store
    /// cache and builds the egress record.
    fn rule_for(&self, update: &RuleUpdate) -> Option<Rule> {
        let Some((dataset, direction)) = message::split_handler_key(&update.path) else {
            warn!(path = update.path, "malformed handler path on update");
            return None;
        };
        let tag = format!("{}-offsets-sequence", update.path);
        let Some(store) = self.cache.get(&tag) else {
            warn!(tag, "no cached sequence store for update");
            return None;
        };
        let record = match store.get_record(update.candidate.index) {
            Ok(record) => record,
            Err(error) => {
                warn!(tag, index = update.candidate.index, %error, "failed to read rule sequence");
                return None;
            }
        };
        Some(Rule {
            dataset: dataset.to_owned(),
            require_forbid: update.candidate.require_forbid(),
            incoming: direction.is_incoming(),
            sequence: record.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use sift_protocol::message::Direction;

    use super::*;
    use crate::storage::{RecordStore, RuleCandidate};

    fn scratch_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("sift-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    fn update(path: &str, index: i64) -> RuleUpdate {
        RuleUpdate {
            path: path.to_owned(),
            candidate: RuleCandidate {
                index,
                allow_count: 0,
                allow_total: 3,
                block_count: 3,
                block_total: 3,
            },
        }
    }

    #[tokio::test]
    async fn resolves_sequences_through_the_cache() {
        let root = scratch_root();
        let cache = StoreCache::new();
        let store = Arc::new(
            RecordStore::open(&root, "d-incoming-offsets-sequence").unwrap(),
        );
        store.add(&[0x00, 0x00, 0x41]).unwrap();
        cache.put("d-incoming-offsets-sequence".to_owned(), store);

        let publisher = RulePublisher::new(cache, broadcast::Sender::new(8));
        let rule = publisher.rule_for(&update("d-incoming", 0)).unwrap();
        assert_eq!(rule.dataset, "d");
        assert_eq!(
            Direction::from_incoming(rule.incoming),
            Direction::Incoming
        );
        assert!(!rule.require_forbid, "block-dominated candidate forbids");
        assert_eq!(&rule.sequence[..], &[0x00, 0x00, 0x41]);
    }

    #[tokio::test]
    async fn missing_store_skips_the_update() {
        let publisher = RulePublisher::new(StoreCache::new(), broadcast::Sender::new(8));
        assert!(publisher.rule_for(&update("d-incoming", 0)).is_none());
    }
}
