use clap::Args;
use vcbox::SandboxStatus;

use crate::cli::GlobalFlags;

/// Sandbox or container addressed by a lifecycle command.
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Sandbox or container id
    pub id: String,
}

pub async fn start(args: TargetArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let status = global.create_runtime()?.start(&args.id).await?;
    report(&args.id, &status);
    Ok(())
}

pub async fn stop(args: TargetArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let status = global.create_runtime()?.stop(&args.id).await?;
    report(&args.id, &status);
    Ok(())
}

pub async fn pause(args: TargetArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let status = global.create_runtime()?.pause(&args.id).await?;
    report(&args.id, &status);
    Ok(())
}

pub async fn resume(args: TargetArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let status = global.create_runtime()?.resume(&args.id).await?;
    report(&args.id, &status);
    Ok(())
}

fn report(id: &str, status: &SandboxStatus) {
    tracing::debug!(id = %id, sandbox_id = %status.id, state = %status.state, "Done");
    println!("{}", id);
}
