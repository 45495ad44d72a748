#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "sift learning server")]
struct Args {
    /// URL the request/reply training ingress listens on.
    #[arg(long, default_value = "tcp://localhost:4567")]
    train_url: String,

    /// URL the publish/subscribe rule egress listens on.
    #[arg(long, default_value = "tcp://localhost:4568")]
    rules_url: String,

    /// Root directory for record stores and count tables.
    #[arg(long, default_value = "store", value_name = "DIR")]
    store_root: PathBuf,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    sift_engine::server::run(&args.train_url, &args.rules_url, args.store_root).await
}
