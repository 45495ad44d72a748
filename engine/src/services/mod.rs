pub mod publish;
pub mod train;

pub use publish::RulePublisher;
pub use train::{RuleUpdate, TrainService};
