//! Shared styling utilities for terminal output.

use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold).
pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Colour a unified diff: additions green, removals red, hunk headers cyan.
pub fn diff(patch: &str) -> String {
    patch
        .lines()
        .map(|line| {
            if line.starts_with("+++") || line.starts_with("---") {
                Style::new().bold().apply_to(line).to_string()
            } else if line.starts_with('+') {
                Style::new().green().apply_to(line).to_string()
            } else if line.starts_with('-') {
                Style::new().red().apply_to(line).to_string()
            } else if line.starts_with("@@") {
                Style::new().cyan().apply_to(line).to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
