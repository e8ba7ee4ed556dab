use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use vendorhub_tracker::progress::PipelineVariant;
use vendorhub_tracker::subscription::{Subscription, SubscriptionConfig};

#[derive(Parser)]
#[command(name = "hubwatch", about = "Watch a vendor evaluation pipeline run live.")]
struct Cli {
    /// Backend base URL
    #[arg(long, default_value = "http://localhost:8000")]
    base_url: String,

    /// Evaluation id to watch
    #[arg(long)]
    evaluation_id: String,

    /// Pipeline variant: application | assessment
    #[arg(long, default_value = "application")]
    variant: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vendorhub_tracker=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let Some(variant) = PipelineVariant::from_wire(&cli.variant) else {
        bail!("unknown pipeline variant '{}' (expected application or assessment)", cli.variant);
    };

    info!("watching evaluation {} at {}", cli.evaluation_id, cli.base_url);

    let config = SubscriptionConfig::new(cli.base_url, cli.evaluation_id, variant);
    let mut subscription = Subscription::open(config);
    let mut timeline = subscription.timeline();

    let source = {
        let completed = subscription.wait_completed();
        tokio::pin!(completed);
        loop {
            tokio::select! {
                source = &mut completed => break source,
                entry = timeline.recv() => {
                    if let Ok(entry) = entry {
                        let stage = entry.event.agent_name().unwrap_or("-");
                        println!(
                            "[{:>4}] {:?} {} {}",
                            entry.local_seq,
                            entry.headline,
                            stage,
                            entry.event.action().unwrap_or(""),
                        );
                    }
                }
            }
        }
    };
    match source {
        Some(source) => info!("pipeline finished (signalled by {source:?})"),
        None => info!("subscription ended without a completion signal"),
    }

    let state = subscription.state();
    println!("completed stages: {:?}", state.progress.completed());
    if let Some(error) = state.progress.error() {
        println!("pipeline error: {error}");
    }
    subscription.close();
    Ok(())
}
