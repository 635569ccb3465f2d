use std::io::Write;

use clap::Args;
use comfy_table::{Attribute, Cell, Table, presets};
use vcbox::SandboxStatus;

use crate::cli::GlobalFlags;
use crate::formatter::{OutputFormat, format_time, print_output};

/// List sandboxes
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only show IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format (table or json)
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

pub async fn execute(args: ListArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    let rt = global.create_runtime()?;
    let sandboxes = rt.list()?;

    if args.quiet {
        for status in sandboxes {
            println!("{}", status.id);
        }
        return Ok(());
    }

    let mut stdout = std::io::stdout().lock();
    print_output(&mut stdout, &sandboxes, args.format, |w, sandboxes| {
        writeln!(w, "{}", build_table(sandboxes))?;
        Ok(())
    })
}

fn build_table(sandboxes: &[SandboxStatus]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_NO_BORDERS)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID").add_attribute(Attribute::Bold),
        Cell::new("STATE").add_attribute(Attribute::Bold),
        Cell::new("CONTAINERS").add_attribute(Attribute::Bold),
        Cell::new("UPDATED").add_attribute(Attribute::Bold),
    ]);

    for status in sandboxes {
        let running = status
            .containers
            .iter()
            .filter(|c| c.state == vcbox::model::StateKind::Running)
            .count();
        table.add_row(vec![
            status.id.clone(),
            status.state.to_string(),
            format!("{}/{}", running, status.containers.len()),
            status
                .last_updated
                .as_ref()
                .map(format_time)
                .unwrap_or_default(),
        ]);
    }
    table
}
