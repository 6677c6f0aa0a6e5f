//! Output formatting utilities

use crate::OutputFormat;
use blockget_types::{MissionInfo, MissionStatus};
use console::{style, StyledObject};
use serde::Serialize;

/// Print a value as JSON, or with `human` for the other formats
pub fn print_output<T: Serialize>(
    value: &T,
    format: OutputFormat,
    human: impl FnOnce(&T),
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => human(value),
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn status_icon(status: MissionStatus) -> StyledObject<&'static str> {
    match status {
        MissionStatus::Finished => style("✓").green(),
        MissionStatus::Running => style("↓").cyan(),
        MissionStatus::Initializing => style("…").cyan(),
        MissionStatus::Paused => style("⏸").yellow(),
        MissionStatus::Error => style("✗").red(),
    }
}

/// Shorten long names for table cells
pub fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() > max {
        let kept: String = name.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        name.to_string()
    }
}

pub fn print_mission_summary(index: usize, mission: &MissionInfo, detailed: bool) {
    let progress = format!("{:.1}%", mission.progress());

    println!(
        "{:>3} {} {} {} [{}]",
        style(index).dim(),
        status_icon(mission.status),
        style(&mission.name).bold(),
        style(&progress).dim(),
        style(mission.status).dim()
    );

    if detailed {
        println!("    ID: {}", mission.id);
        println!("    URL: {}", mission.url);
        println!("    Path: {}", mission.path().display());
        match mission.length {
            Some(length) => println!(
                "    Size: {} / {}",
                format_bytes(mission.done),
                format_bytes(length)
            ),
            None => println!("    Size: unknown"),
        }
        if mission.blocks > 0 {
            println!(
                "    Blocks: {} / {} ({} each), {} thread(s){}",
                mission.completed_blocks,
                mission.blocks,
                format_bytes(mission.block_size),
                mission.thread_count,
                if mission.fallback { ", single stream" } else { "" }
            );
        }
        if let Some(error) = mission.error {
            println!("    Error: {}", style(format!("{:?} ({})", error, error.code())).red());
        }
        if mission.recovered {
            println!("    {}", style("Recovered from a previous session").dim());
        }
        println!();
    }
}
