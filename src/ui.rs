use colored::Colorize;
use rollout::{CheckOutcome, PhaseStatus, ResourceStatus, RunStatus, Severity};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a step indicator
pub fn step(num: usize, total: usize, msg: &str) {
    println!("{} {}", format!("[{num}/{total}]").blue().bold(), msg);
}

// ============================================================================
// Status Glyphs
// ============================================================================

pub fn run_status(status: RunStatus) -> String {
    match status {
        RunStatus::Succeeded => status.to_string().green().to_string(),
        RunStatus::PartiallyRecovered => status.to_string().yellow().to_string(),
        RunStatus::Failed | RunStatus::Aborted => status.to_string().red().to_string(),
    }
}

pub fn phase_glyph(status: PhaseStatus) -> String {
    match status {
        PhaseStatus::Completed => "✓".green().to_string(),
        PhaseStatus::Failed => "✗".red().to_string(),
        PhaseStatus::Running => "…".yellow().to_string(),
        PhaseStatus::NotStarted => "·".dimmed().to_string(),
    }
}

pub fn resource_status(status: ResourceStatus) -> String {
    match status {
        ResourceStatus::Ready => status.to_string().green().to_string(),
        ResourceStatus::Pending => status.to_string().yellow().to_string(),
        ResourceStatus::Failed => status.to_string().red().to_string(),
        ResourceStatus::Deleted => status.to_string().dimmed().to_string(),
    }
}

pub fn check_glyph(outcome: CheckOutcome) -> String {
    match outcome {
        CheckOutcome::Pass => "✓".green().to_string(),
        CheckOutcome::Warn => "⚠".yellow().to_string(),
        CheckOutcome::Fail => "✗".red().to_string(),
    }
}

pub fn severity(severity: Severity) -> String {
    let label = format!("[{severity}]");
    match severity {
        Severity::Critical => label.red().to_string(),
        Severity::Warning => label.yellow().to_string(),
        Severity::Info => label.dimmed().to_string(),
    }
}

/// Format a millisecond duration as `850ms`, `12.4s` or `3m 05s`
pub fn format_duration_ms(ms: i64) -> String {
    let ms = ms.max(0);
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_ms() {
        assert_eq!(format_duration_ms(850), "850ms");
        assert_eq!(format_duration_ms(12_400), "12.4s");
        assert_eq!(format_duration_ms(185_000), "3m 05s");
        assert_eq!(format_duration_ms(-5), "0ms");
    }

    #[test]
    fn test_run_status_keeps_label() {
        colored::control::set_override(false);
        assert_eq!(run_status(RunStatus::PartiallyRecovered), "partially recovered");
        assert_eq!(severity(Severity::Critical), "[critical]");
        colored::control::unset_override();
    }
}
