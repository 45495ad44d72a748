use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;
use sift_protocol::message::{self, Request, TrainPacket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::storage::{
    Class, PrefixIndex, RecordStore, RuleCandidate, StoreCache, StoreError,
};

/// Best-rule update fanned in from one handler, keyed by its handler path.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleUpdate {
    pub path: String,
    pub candidate: RuleCandidate,
}

const PACKET_QUEUE: usize = 16;
const RULE_UPDATE_QUEUE: usize = 10;

#[derive(Debug, Clone)]
struct HandlerClient {
    packets: mpsc::Sender<TrainPacket>,
}

/// Terminates the request/reply training ingress: decodes tagged requests,
/// lazily creates one handler per `{dataset}-{direction}` key and routes
/// packets to it. Replies are always `success`; failures are contained and
/// logged so the ingress stays live.
#[derive(Debug)]
pub struct TrainService {
    root: PathBuf,
    handlers: DashMap<String, HandlerClient>,
    cache: StoreCache,
    updates: mpsc::Sender<RuleUpdate>,
}

impl TrainService {
    pub fn new(root: PathBuf, cache: StoreCache, updates: mpsc::Sender<RuleUpdate>) -> Self {
        Self {
            root,
            handlers: DashMap::new(),
            cache,
            updates,
        }
    }

    /// Handles one framed ingress request and returns the reply frame.
    pub async fn handle(&self, frame: &[u8]) -> Bytes {
        match Request::decode(frame) {
            Ok(Request::Train(packet)) => self.route(packet).await,
            Ok(request) => {
                debug!(tag = request.tag(), "ignoring reserved request");
            }
            Err(error) => {
                warn!(%error, "failed to decode ingress request");
            }
        }
        Bytes::from_static(message::SUCCESS)
    }

    async fn route(&self, packet: TrainPacket) {
        let key = packet.handler_key();
        match self.load(&key) {
            Ok(client) => {
                if client.packets.send(packet).await.is_err() {
                    warn!(key, "handler worker gone, dropping packet");
                }
            }
            Err(error) => {
                warn!(key, %error, "could not load handler");
            }
        }
    }

    /// Returns the handler for `key`, creating it on first use. A key whose
    /// stores fail to open is not cached; the next request retries (and
    /// fails identically while the cause persists).
    fn load(&self, key: &str) -> Result<HandlerClient, StoreError> {
        match self.handlers.entry(key.to_owned()) {
            dashmap::Entry::Occupied(oe) => Ok(oe.get().clone()),
            dashmap::Entry::Vacant(ve) => {
                let client = self.start_handler(key)?;
                ve.insert(client.clone());
                Ok(client)
            }
        }
    }

    fn start_handler(&self, key: &str) -> Result<HandlerClient, StoreError> {
        let store = match self.cache.get(key) {
            Some(store) => store,
            None => {
                let store = Arc::new(RecordStore::open(&self.root, key)?);
                self.cache.put(key.to_owned(), store.clone());
                store
            }
        };

        let (rule_tx, rule_rx) = mpsc::channel(RULE_UPDATE_QUEUE);
        let prefixes = PrefixIndex::open(&self.root, key, rule_tx)?;
        self.cache.put(
            format!("{key}-offsets-sequence"),
            prefixes.sequences().store().clone(),
        );

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE);
        let handler = StoreHandler {
            path: key.to_owned(),
            store,
            prefixes,
        };
        info!(key, "starting handler");
        tokio::spawn(handler.run(packet_rx));
        tokio::spawn(forward_rule_updates(
            key.to_owned(),
            rule_rx,
            self.updates.clone(),
        ));

        Ok(HandlerClient { packets: packet_tx })
    }
}

/// Per-key worker owning the payload store and prefix index. Packets are
/// processed strictly in arrival order; a best-rule update can only follow
/// the increments of the packet that produced it.
struct StoreHandler {
    path: String,
    store: Arc<RecordStore>,
    prefixes: PrefixIndex,
}

impl StoreHandler {
    async fn run(mut self, mut packets: mpsc::Receiver<TrainPacket>) {
        while let Some(packet) = packets.recv().await {
            self.handle(packet).await;
        }
        debug!(path = %self.path, "handler worker stopping");
    }

    async fn handle(&mut self, packet: TrainPacket) {
        let index = match self.store.add(&packet.payload) {
            Ok(index) => index,
            Err(StoreError::EmptySequence) => {
                debug!(path = %self.path, "dropping empty payload");
                return;
            }
            Err(error) => {
                warn!(path = %self.path, %error, "failed to store payload");
                return;
            }
        };
        let record = match self.store.get_record(index) {
            Ok(record) => record,
            Err(error) => {
                warn!(path = %self.path, index, %error, "failed to read back payload");
                return;
            }
        };
        // Unreachable on a correct store; dropped defensively.
        if record.index < self.store.last_index() {
            warn!(
                path = %self.path,
                index = record.index,
                last = self.store.last_index(),
                "rejecting duplicate record"
            );
            return;
        }

        let class = Class::from_allow_block(packet.allow_block);
        if let Err(error) = self.prefixes.process_bytes(class, &record.data).await {
            warn!(path = %self.path, %error, "failed to process payload prefixes");
        }
    }
}

async fn forward_rule_updates(
    path: String,
    mut rules: mpsc::Receiver<RuleCandidate>,
    updates: mpsc::Sender<RuleUpdate>,
) {
    while let Some(candidate) = rules.recv().await {
        let update = RuleUpdate {
            path: path.clone(),
            candidate,
        };
        if updates.send(update).await.is_err() {
            return;
        }
    }
}
