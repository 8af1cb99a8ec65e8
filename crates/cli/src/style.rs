//! Terminal styling for check results.

use console::Style;

fn marked(mark: &str, style: Style, msg: &str) -> String {
    format!("{} {}", style.apply_to(mark), msg)
}

/// Clean result or completed action.
pub fn success(msg: &str) -> String {
    marked("✓", Style::new().green(), msg)
}

/// Conflicts found, or a failed run.
pub fn error(msg: &str) -> String {
    marked("✗", Style::new().red(), msg)
}

/// Cancellation and non-fatal problems such as a failed cleanup.
pub fn warn(msg: &str) -> String {
    marked("⚠", Style::new().yellow(), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

/// One finished external step: dim log name with its wall time.
pub fn step_line(log_name: &str, elapsed_secs: f64) -> String {
    let dim = Style::new().dim();
    format!(
        "{} {}",
        dim.apply_to(log_name),
        dim.clone().italic().apply_to(format!("{:.1}s", elapsed_secs))
    )
}

/// Pipeline stage name as shown in status messages.
pub fn stage(name: &str) -> String {
    Style::new().cyan().apply_to(name).to_string()
}
