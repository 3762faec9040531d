use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::stream::{BoxStream, StreamExt};
use hostscope::config;
use hostscope::data::StateKind;
use hostscope::discovery::{self, DiscoveryCache};
use hostscope::status::{distinct_ports, StatusFilter, StatusPoller};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "hostscope")]
#[command(about = "Discover running agent hosts and show their session status")]
#[command(version)]
struct Args {
    /// Path to config file
    #[arg(long, short)]
    config: Option<std::path::PathBuf>,

    /// Discovery window per source, in milliseconds
    #[arg(long, short)]
    timeout: Option<u64>,

    /// Print JSON lines instead of columns
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List running instances as they are found
    Discover,

    /// Show session status across all running instances
    Status {
        /// Only sessions in this state (idle, busy, retry)
        #[arg(long)]
        state: Option<StateKind>,

        /// Only sessions whose id contains this text
        #[arg(long)]
        session: Option<String>,

        /// Only retrying sessions at or beyond this attempt
        #[arg(long)]
        min_attempt: Option<u64>,

        /// Refresh every N seconds until interrupted
        #[arg(long)]
        watch: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostscope=info".parse()?),
        )
        .init();

    let mut config = config::load(args.config.as_deref())?;
    if let Some(timeout_ms) = args.timeout {
        config.discovery.timeout_ms = timeout_ms;
    }

    let cache = DiscoveryCache::new(discovery::default_sources(&config.discovery));
    let timeout = config.discovery.timeout();

    match args.command {
        Command::Discover => {
            until_interrupted(&cache, print_all(cache.discover(timeout), args.json)).await?;
        }
        Command::Status {
            state,
            session,
            min_attempt,
            watch,
        } => {
            let poller = StatusPoller::new(&config.status)?;
            let filter = StatusFilter {
                state,
                session,
                min_attempt,
            };

            loop {
                let instances = distinct_ports(cache.discover(timeout));
                let statuses = filter.clone().apply(poller.poll_statuses(instances));
                if !until_interrupted(&cache, print_all(statuses, args.json)).await? {
                    break;
                }

                let Some(secs) = watch else { break };
                tracing::debug!("{} instances known, next refresh in {}s", cache.len(), secs);
                if !until_interrupted(&cache, async {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    Ok(())
                })
                .await?
                {
                    break;
                }
                println!();
            }
        }
    }

    Ok(())
}

/// Run `work` unless Ctrl-C arrives first, in which case discovery is
/// stopped. Returns whether `work` finished.
async fn until_interrupted<F>(cache: &DiscoveryCache, work: F) -> Result<bool>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        result = work => result.map(|_| true),
        _ = tokio::signal::ctrl_c() => {
            tracing::debug!("Interrupted, stopping discovery");
            cache.stop();
            Ok(false)
        }
    }
}

async fn print_all<T>(mut items: BoxStream<'static, T>, json: bool) -> Result<()>
where
    T: Serialize + Display,
{
    while let Some(item) = items.next().await {
        if json {
            println!("{}", serde_json::to_string(&item)?);
        } else {
            println!("{item}");
        }
    }
    Ok(())
}
