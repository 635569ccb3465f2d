use clap::Args;

use crate::cli::GlobalFlags;

/// Delete one or more sandboxes or containers
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Sandbox or container ids
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Stop running targets before deleting them
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: DeleteArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let rt = global.create_runtime()?;

    let mut failed = 0;
    for id in &args.ids {
        match rt.delete(id, args.force).await {
            Ok(()) => println!("{}", id),
            Err(e) => {
                eprintln!("Error removing {}: {}", id, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("failed to remove {} of {} target(s)", failed, args.ids.len());
    }
    Ok(())
}
