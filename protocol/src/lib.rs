pub mod client;
pub mod frame;
pub mod message;

pub use client::{Client, ClientError, RuleSubscriber};
pub use message::{Direction, Request, Rule, TrainPacket};
