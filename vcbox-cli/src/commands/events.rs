use std::time::Duration;

use clap::Args;
use serde::Serialize;
use vcbox::agent::ContainerStats;

use crate::cli::GlobalFlags;

/// Display container resource usage
#[derive(Args, Debug)]
pub struct EventsArgs {
    /// Container id
    pub id: String,

    /// Print one stats event and exit
    #[arg(long)]
    pub stats: bool,

    /// Seconds between stats events
    #[arg(long, default_value_t = 5)]
    pub interval: u64,
}

#[derive(Debug, Serialize)]
struct Event<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
    data: ContainerStats,
}

pub async fn execute(args: EventsArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let rt = global.create_runtime()?;
    if args.interval == 0 {
        anyhow::bail!("interval must be at least one second");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval));
    loop {
        ticker.tick().await;
        let event = Event {
            kind: "stats",
            id: &args.id,
            data: rt.stats(&args.id).await?,
        };
        println!("{}", serde_json::to_string(&event)?);
        if args.stats {
            return Ok(());
        }
    }
}
