//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table, or an empty-list notice
pub fn print_table<T: Tabled>(items: Vec<T>, empty_message: &str) {
    if items.is_empty() {
        println!("{}", empty_message.yellow());
        return;
    }
    let table = Table::new(items).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any API value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format currency
pub fn format_currency(amount: f64) -> String {
    format!("${:.2}", amount)
}

/// "08:00-18:00 Mon,Tue" style summary of an active-hours window
pub fn format_window(weekdays: &[String], start_hour: u32, end_hour: u32) -> String {
    if weekdays.is_empty() {
        return "never".to_string();
    }
    if start_hour == end_hour {
        return format!("all day {}", weekdays.join(","));
    }
    format!("{:02}:00-{:02}:00 {}", start_hour, end_hour, weekdays.join(","))
}

/// Shorten an RFC 3339 timestamp to "YYYY-MM-DD HH:MM:SS"
pub fn format_timestamp(ts: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(ts) {
        Ok(parsed) => parsed.format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => ts.to_string(),
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "available" | "ready" | "healthy" | "bound" | "steady" => status.green().to_string(),
        "starting" | "rolling_out" | "scaling" | "pending" | "waiting" => {
            status.blue().to_string()
        }
        "parked" => status.dimmed().to_string(),
        "degraded" => status.yellow().to_string(),
        "blocked" | "unreachable" | "unhealthy" | "lost" => status.red().to_string(),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_window() {
        let days = vec!["Mon".to_string(), "Fri".to_string()];
        assert_eq!(format_window(&days, 8, 18), "08:00-18:00 Mon,Fri");
        assert_eq!(format_window(&days, 0, 0), "all day Mon,Fri");
        assert_eq!(format_window(&[], 8, 18), "never");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp("2024-01-06T10:00:00Z"), "2024-01-06 10:00:00");
        assert_eq!(format_timestamp("garbage"), "garbage");
    }

    #[test]
    fn test_format_currency() {
        assert_eq!(format_currency(48.9), "$48.90");
    }
}
