use clap::Args;

use crate::cli::GlobalFlags;
use crate::formatter::format_json;

/// Print the state of a sandbox as JSON
#[derive(Args, Debug)]
pub struct StateArgs {
    /// Sandbox or container id
    pub id: String,
}

pub async fn execute(args: StateArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let rt = global.create_runtime()?;
    let status = rt.status(&args.id)?;
    println!("{}", format_json(&status)?);
    Ok(())
}
