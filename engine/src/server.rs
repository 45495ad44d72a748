use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use sift_protocol::frame::{framed, strip_scheme};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
};
use tracing::{debug, info, warn};

use crate::{
    services::{RulePublisher, TrainService},
    storage::StoreCache,
};

/// Shared fan-in queue from all handlers to the publisher.
const UPDATE_QUEUE: usize = 100;

/// Frames a lagging egress subscriber may fall behind before it starts
/// skipping rules.
const RULE_FEED_LAG: usize = 64;

/// Brings up the whole engine: the train service behind the request/reply
/// ingress at `train_url`, and the rule feed behind the publish/subscribe
/// egress at `rules_url`, with all stores rooted at `store_root`.
pub async fn run(train_url: &str, rules_url: &str, store_root: PathBuf) -> eyre::Result<()> {
    info!(train_url, rules_url, store_root = %store_root.display(), "starting");

    std::fs::create_dir_all(&store_root)?;

    let cache = StoreCache::new();
    let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE);
    let service = Arc::new(TrainService::new(store_root, cache.clone(), updates_tx));

    let feed = broadcast::Sender::new(RULE_FEED_LAG);
    tokio::spawn(RulePublisher::new(cache, feed.clone()).run(updates_rx));

    let train_listener = TcpListener::bind(strip_scheme(train_url)).await?;
    let rules_listener = TcpListener::bind(strip_scheme(rules_url)).await?;
    info!(train = train_url, rules = rules_url, "listening");

    tokio::select! {
        _ = serve_training(train_listener, service) => {}
        _ = serve_rules(rules_listener, feed) => {}
        _ = shutdown_signal() => {
            info!("shutting down");
        }
    }

    Ok(())
}

/// Accept loop for the training ingress: each connection alternates framed
/// request/reply against the train service.
pub async fn serve_training(listener: TcpListener, service: Arc<TrainService>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "ingress accept failed");
                continue;
            }
        };
        debug!(%peer, "training client connected");
        let service = service.clone();
        tokio::spawn(async move {
            let mut frames = framed(stream);
            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(error) => {
                        warn!(%peer, %error, "ingress framing error");
                        break;
                    }
                };
                let reply = service.handle(&frame).await;
                if frames.send(reply).await.is_err() {
                    break;
                }
            }
            debug!(%peer, "training client disconnected");
        });
    }
}

/// Accept loop for the rule egress: every subscriber receives each published
/// frame from the point it connects; a lagging subscriber skips.
pub async fn serve_rules(listener: TcpListener, feed: broadcast::Sender<Bytes>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "egress accept failed");
                continue;
            }
        };
        info!(%peer, "rule subscriber connected");
        let mut rules = feed.subscribe();
        tokio::spawn(async move {
            let mut frames = framed(stream);
            loop {
                match rules.recv().await {
                    Ok(frame) => {
                        if frames.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%peer, skipped, "rule subscriber lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(%peer, "rule subscriber disconnected");
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl-c");
    };

    #[cfg(unix)]
    let term = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, starting shutdown");
        },
        _ = term => {
            info!("received SIGTERM, starting shutdown");
        },
    }
}
