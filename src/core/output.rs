//! Colored output and progress reporting for formula operations
//!
//! Uses owo-colors for terminal colors and indicatif for progress bars.
//! Everything the installer tells the user goes through here.

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::time::Duration;

/// Print an action header (blue, bold)
/// Example: "==> Installing aetherlang 1.1.0"
pub fn action(message: &str) {
    println!("{} {}", "==>".blue().bold(), message.bold());
}

/// Print a pipeline step (cyan arrow)
/// Example: "  -> fetch"
pub fn step(name: &str) {
    println!("  {} {}", "->".cyan(), name);
}

/// Print a detail line (dimmed)
/// Example: "     sha256 ok"
pub fn detail(message: &str) {
    println!("     {}", message.dimmed());
}

/// Print a success message (green)
pub fn success(message: &str) {
    println!("{} {}", "==>".green().bold(), message.green());
}

/// Print an info message (cyan)
pub fn info(message: &str) {
    println!("{} {}", "::".cyan(), message);
}

/// Print a warning message (yellow)
pub fn warning(message: &str) {
    eprintln!("{} {}", "warning:".yellow().bold(), message.yellow());
}

/// Print an error message (red)
pub fn error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message.red());
}

/// Print a skip message (dimmed)
/// Example: "==> aetherlang 1.1.0 already installed, skipping"
pub fn skip(message: &str) {
    println!("{} {}", "==>".dimmed(), message.dimmed());
}

/// Print a formula row in list output
pub fn list_item(name: &str, status: &str, is_installed: bool) {
    if is_installed {
        println!("  {} {}", name.green(), status.dimmed());
    } else {
        println!("  {} {}", name, status.dimmed());
    }
}

/// Print an aligned `key: value` line for info output
pub fn field(key: &str, value: &str) {
    println!("{:<12} {}", format!("{}:", key).bold(), value);
}

/// Create a download progress bar with a known total size
pub fn download_progress(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("     {spinner:.cyan} [{bar:30.cyan/dim}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸━"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Create a spinner for operations of unknown length
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("     {spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Switch a spinner to a byte progress bar once the size is known
pub fn upgrade_to_bytes(pb: &ProgressBar, total: u64) {
    pb.set_length(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("     {spinner:.cyan} [{bar:30.cyan/dim}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸━"),
    );
}

/// Finish a progress bar and clear it
pub fn progress_done(pb: ProgressBar) {
    pb.finish_and_clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_bar_creation() {
        let pb = download_progress(1000);
        pb.set_position(500);
        progress_done(pb);
    }

    #[test]
    fn test_spinner_upgrades_to_bytes() {
        let pb = spinner("downloading aeth");
        upgrade_to_bytes(&pb, 4096);
        assert_eq!(pb.length(), Some(4096));
        progress_done(pb);
    }
}
