//! CLI Output Formatting Module
//! Colorized terminal output for plans, progress and records

use colored::{ColoredString, Colorize};

use crate::engine::model::{InstallationRecord, Outcome};
use crate::engine::updater::{ProgressEvent, Stage};

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print an info message
    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    /// One line per installation record; attention-worthy ones stand out.
    pub fn record(record: &InstallationRecord) {
        let marker = if record.needs_attention {
            "!".red().bold()
        } else {
            "•".bright_black()
        };
        println!(
            "  {} {} {} {}",
            marker,
            record.created_at.format("%Y-%m-%d %H:%M:%S").to_string().bright_black(),
            outcome_label(record.outcome),
            record.summary()
        );
        if let Some(detail) = &record.detail {
            println!("      {}", detail.bright_black());
        }
    }

    /// Live stage transition from a running update.
    pub fn progress(event: &ProgressEvent) {
        println!("  {} {} {}", "▶".bright_blue(), event.hardware_id, stage_label(&event.stage));
    }

    /// Print a divider
    pub fn divider() {
        println!("{}", "─".repeat(60).bright_black());
    }
}

pub fn stage_label(stage: &Stage) -> String {
    match stage {
        Stage::Downloading => "downloading".to_string(),
        Stage::Verifying => "verifying".to_string(),
        Stage::Queued => "waiting for install gate".to_string(),
        Stage::Transaction { state } => state.to_string(),
        Stage::Finished { outcome } => outcome.to_string(),
    }
}

pub fn outcome_label(outcome: Outcome) -> ColoredString {
    let text = outcome.to_string();
    match outcome {
        Outcome::Succeeded => text.green().bold(),
        Outcome::RolledBack | Outcome::Cancelled => text.yellow(),
        Outcome::InstallFailed | Outcome::Failed => text.red(),
        Outcome::RollbackFailed | Outcome::Unknown => text.red().bold(),
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}
