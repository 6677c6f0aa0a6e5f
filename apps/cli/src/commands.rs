//! CLI command implementations

use crate::output::{format_bytes, print_mission_summary, print_output, truncate_name};
use crate::progress::{MissionProgress, Outcome};
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Result};
use blockget_core::{BlockgetCore, MissionRequest};
use blockget_types::{MissionEvent, MissionId, MissionStatus, Settings};
use console::style;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// Resolve a mission given as a list index or an ID
async fn resolve(core: &BlockgetCore, mission: &str) -> Result<MissionId> {
    if let Ok(index) = mission.parse::<usize>() {
        return core
            .id_at(index)
            .await
            .ok_or_else(|| anyhow!("No mission at index {}", index));
    }
    let id = Uuid::parse_str(mission).map_err(|_| anyhow!("Not an index or ID: {}", mission))?;
    core.mission(id).await?;
    Ok(id)
}

// ============================================================================
// Mission Commands
// ============================================================================

pub async fn get(core: &BlockgetCore, request: MissionRequest, format: OutputFormat) -> Result<()> {
    let events = core.subscribe();
    let started = core.start_mission(request).await?;

    if matches!(format, OutputFormat::Human | OutputFormat::Table) {
        let info = core.mission(started.id).await?;
        println!(
            "{} Started #{}: {}",
            style("↓").cyan().bold(),
            started.index,
            style(info.path().display()).cyan()
        );
    }

    watch(core, started.id, events, format).await
}

pub async fn resume(
    core: &BlockgetCore,
    mission: &str,
    retry: bool,
    format: OutputFormat,
) -> Result<()> {
    let id = resolve(core, mission).await?;
    let events = core.subscribe();

    let started = if retry {
        core.retry_mission(id).await?
    } else {
        core.resume_mission(id).await?
    };

    if !started {
        let info = core.mission(id).await?;
        match info.status {
            MissionStatus::Finished => {
                println!("{} Already finished: {}", style("✓").green().bold(), info.name);
                return Ok(());
            }
            MissionStatus::Error => bail!(
                "Mission {} failed earlier ({:?}); use --retry to try again",
                info.name,
                info.error.unwrap_or(blockget_types::ErrorCode::Unknown)
            ),
            status => bail!("Mission {} cannot be resumed while {}", info.name, status),
        }
    }

    watch(core, id, events, format).await
}

/// Follow a mission until it stops; Ctrl-C pauses every mission
async fn watch(
    core: &BlockgetCore,
    id: MissionId,
    mut events: broadcast::Receiver<MissionEvent>,
    format: OutputFormat,
) -> Result<()> {
    let visible = matches!(format, OutputFormat::Human | OutputFormat::Table);
    let info = core.mission(id).await?;
    let mut progress = MissionProgress::new(&info, visible);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut outcome = progress.refresh(&info);
    while outcome.is_none() {
        tokio::select! {
            _ = &mut ctrl_c => {
                core.shutdown().await;
                progress.paused();
                outcome = Some(Outcome::Paused);
            }
            event = events.recv() => match event {
                Ok(event) => outcome = progress.handle_event(&event),
                Err(RecvError::Lagged(_)) => {
                    let info = core.mission(id).await?;
                    outcome = progress.refresh(&info);
                }
                Err(RecvError::Closed) => outcome = Some(Outcome::Paused),
            },
        }
    }

    let info = core.mission(id).await.ok();
    match outcome {
        Some(Outcome::Failed { code, message }) => {
            if let (OutputFormat::Json, Some(info)) = (format, &info) {
                println!("{}", serde_json::to_string_pretty(info)?);
            }
            Err(anyhow!("Mission failed with code {}: {}", code, message))
        }
        Some(Outcome::Paused) => {
            if let Some(info) = info {
                print_output(&info, format, |info| {
                    println!(
                        "{} Paused at {:.1}%. Resume with: blockget resume {}",
                        style("⏸").yellow(),
                        info.progress(),
                        info.id
                    );
                })?;
            }
            Ok(())
        }
        Some(Outcome::Removed) => Ok(()),
        Some(Outcome::Finished) | None => {
            if let Some(info) = info {
                print_output(&info, format, |info| {
                    println!(
                        "{} Saved {} to {}",
                        style("✓").green().bold(),
                        format_bytes(info.length.unwrap_or(info.done)),
                        style(info.path().display()).cyan()
                    );
                })?;
            }
            Ok(())
        }
    }
}

pub async fn list_missions(
    core: &BlockgetCore,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let missions = core.list_missions().await;

    // Keep list indices stable under filtering
    let filtered: Vec<_> = missions
        .into_iter()
        .enumerate()
        .filter(|(_, m)| match status_filter {
            Some(ref status) => m.status.to_string().contains(&status.to_lowercase()),
            None => true,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            let infos: Vec<_> = filtered.iter().map(|(_, m)| m).collect();
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct MissionRow {
                index: usize,
                id: String,
                name: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<MissionRow> = filtered
                .iter()
                .map(|(index, m)| MissionRow {
                    index: *index,
                    id: m.id.to_string()[..8].to_string(),
                    name: truncate_name(&m.name, 30),
                    size: m
                        .length
                        .map(format_bytes)
                        .unwrap_or_else(|| "?".to_string()),
                    progress: format!("{:.1}%", m.progress()),
                    status: m.status.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No missions found").dim());
                return Ok(());
            }

            for (index, mission) in &filtered {
                print_mission_summary(*index, mission, show_all);
            }
            println!();
            println!("{} mission(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

pub async fn show_info(core: &BlockgetCore, mission: &str, format: OutputFormat) -> Result<()> {
    let id = resolve(core, mission).await?;
    let info = core.mission(id).await?;
    let index = core.store().index_of(id).await.unwrap_or_default();

    print_output(&info, format, |info| print_mission_summary(index, info, true))
}

pub async fn delete_mission(
    core: &BlockgetCore,
    mission: &str,
    yes: bool,
    format: OutputFormat,
) -> Result<()> {
    let id = resolve(core, mission).await?;
    let info = core.mission(id).await?;

    if !yes && matches!(format, OutputFormat::Human) {
        use dialoguer::Confirm;
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete {} and its file?", info.path().display()))
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    core.delete_mission(id).await?;
    print_output(&info, format, |info| {
        println!("{} Deleted {}", style("✓").green().bold(), info.name);
    })
}

// ============================================================================
// Config Commands
// ============================================================================

const CONFIG_KEYS: &[&str] = &[
    "download_dir",
    "search_locations",
    "default_threads",
    "block_size",
    "max_name_attempts",
    "connect_timeout_secs",
    "request_timeout_secs",
    "user_agent",
];

fn config_value(settings: &Settings, key: &str) -> Result<String> {
    let value = match key {
        "download_dir" => settings.download_dir.display().to_string(),
        "search_locations" => settings
            .search_locations
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(","),
        "default_threads" => settings.default_threads.to_string(),
        "block_size" => settings.block_size.to_string(),
        "max_name_attempts" => settings.max_name_attempts.to_string(),
        "connect_timeout_secs" => settings.connect_timeout_secs.to_string(),
        "request_timeout_secs" => settings
            .request_timeout_secs
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string()),
        "user_agent" => settings.user_agent.clone(),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    };
    Ok(value)
}

fn set_config_value(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    match key {
        "download_dir" => settings.download_dir = PathBuf::from(value),
        "search_locations" => {
            settings.search_locations = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect()
        }
        "default_threads" => {
            let threads: u32 = value.parse()?;
            if threads == 0 {
                bail!("default_threads must be at least 1");
            }
            settings.default_threads = threads;
        }
        "block_size" => {
            let block_size: u64 = value.parse()?;
            if block_size == 0 {
                bail!("block_size must be at least 1");
            }
            settings.block_size = block_size;
        }
        "max_name_attempts" => settings.max_name_attempts = value.parse()?,
        "connect_timeout_secs" => settings.connect_timeout_secs = value.parse()?,
        "request_timeout_secs" => {
            settings.request_timeout_secs = match value {
                "none" | "" => None,
                secs => Some(secs.parse()?),
            }
        }
        "user_agent" => settings.user_agent = value.to_string(),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    }
    Ok(())
}

pub async fn config_action(
    core: &BlockgetCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.settings();
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(settings)?);
                }
                _ => {
                    println!("blockget Configuration:");
                    println!();
                    for key in CONFIG_KEYS {
                        println!("  {}: {}", key, config_value(settings, key)?);
                    }
                    println!();
                    println!("  Data dir: {}", core.storage.data_dir().display());
                }
            }
        }
        Some(ConfigAction::Get { key }) => {
            println!("{}", config_value(core.settings(), &key)?);
        }
        Some(ConfigAction::Set { key, value }) => {
            let mut settings = core.settings().clone();
            set_config_value(&mut settings, &key, &value)?;
            core.update_settings(&settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }
        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;
            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;
            if confirmed {
                core.storage.reset_settings().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }
    Ok(())
}
