//! Shared styling utilities for CLI output.

use console::Style;

use wcengine_core::StatusFlags;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Status labels, colored by the most significant group present.
pub fn status_labels(flags: StatusFlags) -> String {
    let text = flags.labels().join(", ");
    let style = if flags.contains(StatusFlags::X_UNRESOLVED) {
        Style::new().red().bold()
    } else if flags.intersects(StatusFlags::U_LOST | StatusFlags::U_FOUND) {
        Style::new().yellow()
    } else if flags.intersects(StatusFlags::S_MASK | StatusFlags::C_MASK) {
        Style::new().green()
    } else {
        Style::new().dim()
    };
    style.apply_to(text).to_string()
}
