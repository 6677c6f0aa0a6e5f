//! Progress bar for a foreground mission

use blockget_types::{ErrorCode, MissionEvent, MissionInfo, MissionStatus};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// How a watched mission ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Paused,
    Failed { code: i32, message: String },
    Removed,
}

/// Progress bar tracking a single mission from its events
pub struct MissionProgress {
    bar: ProgressBar,
    info: MissionInfo,
}

impl MissionProgress {
    pub fn new(info: &MissionInfo, visible: bool) -> Self {
        let bar = ProgressBar::new(info.length.unwrap_or(0));
        if !visible {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        if let Ok(template) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
        ) {
            bar.set_style(template.progress_chars("█▓▒░  "));
        }
        bar.set_position(info.done);
        if info.fallback {
            bar.set_message(style("single stream").dim().to_string());
        }

        Self {
            bar,
            info: info.clone(),
        }
    }

    /// Apply an event; returns the outcome once the mission stops
    pub fn handle_event(&mut self, event: &MissionEvent) -> Option<Outcome> {
        if event.mission_id() != self.info.id {
            return None;
        }

        match event {
            MissionEvent::Progress { done, total, .. } => {
                self.bar.set_length(*total);
                self.bar.set_position(*done);
                None
            }
            MissionEvent::Finished { .. } => {
                self.bar.finish_with_message(format!(
                    "{} {}",
                    style("✓").green().bold(),
                    self.info.name
                ));
                Some(Outcome::Finished)
            }
            MissionEvent::Failed { code, message, .. } => {
                let label = ErrorCode::from_code(*code)
                    .map(|c| format!("{:?}", c))
                    .unwrap_or_else(|| code.to_string());
                self.bar.abandon_with_message(format!(
                    "{} Failed ({}): {}",
                    style("✗").red().bold(),
                    label,
                    message
                ));
                Some(Outcome::Failed {
                    code: *code,
                    message: message.clone(),
                })
            }
            MissionEvent::PermissionDenied { location, .. } => {
                self.bar.println(format!(
                    "{} Permission denied: {}",
                    style("!").yellow().bold(),
                    location.display()
                ));
                None
            }
            MissionEvent::StatusChanged { status, .. } => {
                match status {
                    MissionStatus::Running => self.bar.set_message(""),
                    MissionStatus::Initializing => {
                        self.bar.set_message(style("probing").dim().to_string())
                    }
                    _ => {}
                }
                None
            }
            MissionEvent::MissionRemoved { .. } => {
                self.bar.abandon_with_message(format!("{} Removed", style("○").dim()));
                Some(Outcome::Removed)
            }
            MissionEvent::MissionAdded { .. } => None,
        }
    }

    /// Resync from a snapshot, used after missed events
    pub fn refresh(&mut self, info: &MissionInfo) -> Option<Outcome> {
        if let Some(length) = info.length {
            self.bar.set_length(length);
        }
        self.bar.set_position(info.done);
        self.info = info.clone();

        match info.status {
            MissionStatus::Finished => {
                self.bar.finish_with_message(format!(
                    "{} {}",
                    style("✓").green().bold(),
                    info.name
                ));
                Some(Outcome::Finished)
            }
            MissionStatus::Error => {
                let code = info.error.unwrap_or(ErrorCode::Unknown);
                self.bar.abandon_with_message(format!(
                    "{} Failed ({:?})",
                    style("✗").red().bold(),
                    code
                ));
                Some(Outcome::Failed {
                    code: code.code(),
                    message: format!("{:?}", code),
                })
            }
            _ => None,
        }
    }

    pub fn paused(&self) {
        self.bar
            .abandon_with_message(format!("{} Paused", style("⏸").yellow()));
    }
}
