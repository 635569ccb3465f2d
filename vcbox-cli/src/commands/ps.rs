use std::io::Write;

use clap::Args;
use vcbox::agent::{ProcessListFormat, ProcessListOptions};

use crate::cli::GlobalFlags;

/// List processes running inside a container
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Container id
    pub id: String,

    /// Output format (table or json)
    #[arg(short, long, default_value = "table")]
    pub format: ProcessListFormat,

    /// Arguments passed to ps inside the container (default: -ef)
    #[arg(last = true)]
    pub ps_args: Vec<String>,
}

pub async fn execute(args: PsArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let rt = global.create_runtime()?;
    let options = ProcessListOptions::new(args.format, args.ps_args);
    let listing = rt.ps(&args.id, &options).await?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(listing.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
