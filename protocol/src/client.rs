use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;

use crate::{
    frame::{FrameStream, framed, strip_scheme},
    message::{DecodeError, EncodeError, Request, Rule, TrainPacket},
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Request/reply client for the training ingress. Used by the capture side
/// and by end-to-end tests; one request is in flight at a time.
#[derive(Debug)]
pub struct Client {
    frames: FrameStream,
}

impl Client {
    pub async fn connect(url: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(strip_scheme(url)).await?;
        Ok(Self {
            frames: framed(stream),
        })
    }

    /// Submits one observed payload for training and returns the server's
    /// reply bytes (always `success`).
    pub async fn add_train_packet(
        &mut self,
        dataset: &str,
        allow_block: bool,
        incoming: bool,
        payload: Bytes,
    ) -> Result<Bytes, ClientError> {
        let request = Request::Train(TrainPacket {
            dataset: dataset.to_owned(),
            allow_block,
            incoming,
            payload,
        });
        self.request(request.encode()?).await
    }

    async fn request(&mut self, frame: Bytes) -> Result<Bytes, ClientError> {
        self.frames.send(frame).await?;
        let reply = self
            .frames
            .next()
            .await
            .ok_or(ClientError::ConnectionClosed)??;
        Ok(reply.freeze())
    }
}

/// Subscriber for the rule egress: connects and yields each published rule.
#[derive(Debug)]
pub struct RuleSubscriber {
    frames: FrameStream,
}

impl RuleSubscriber {
    pub async fn connect(url: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(strip_scheme(url)).await?;
        Ok(Self {
            frames: framed(stream),
        })
    }

    pub async fn next_rule(&mut self) -> Result<Rule, ClientError> {
        let frame = self
            .frames
            .next()
            .await
            .ok_or(ClientError::ConnectionClosed)??;
        Ok(Rule::decode(&frame)?)
    }
}
