use clap::Parser;
use locking_cache::cli::{self, Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Get { key } => cli::ops::get(&key).await,
        Command::MultiGet { keys } => cli::ops::multi_get(&keys).await,
        Command::Put { key, value, ttl } => cli::ops::put(&key, &value, ttl).await,
        Command::Del { key } => cli::ops::del(&key).await,
        Command::Lock {
            key,
            ttl,
            timeout_ms,
        } => cli::ops::lock(&key, ttl, timeout_ms).await,
        Command::Unlock { key, force } => cli::ops::unlock(&key, force).await,
        Command::Stampede(args) => cli::stampede::run(args).await,
    }
}
