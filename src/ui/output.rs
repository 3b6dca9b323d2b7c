//! Styled terminal output. Colors drop out automatically when stdout is
//! not a terminal.

use std::sync::OnceLock;

use owo_colors::{OwoColorize, Style};

use super::Icons;

static THEME: OnceLock<Theme> = OnceLock::new();

#[derive(Debug, Clone)]
struct Theme {
    header: Style,
    success: Style,
    error: Style,
    dim: Style,
}

impl Theme {
    fn detect() -> Self {
        if console::Term::stdout().is_term() {
            Self {
                header: Style::new().cyan().bold(),
                success: Style::new().green().bold(),
                error: Style::new().red().bold(),
                dim: Style::new().white().dimmed(),
            }
        } else {
            Self {
                header: Style::new(),
                success: Style::new(),
                error: Style::new(),
                dim: Style::new(),
            }
        }
    }
}

fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}

pub fn header(text: &str) {
    println!("{} {}", Icons::ROCKET, text.style(theme().header.clone()));
}

pub fn status(icon: &str, label: &str, value: &str) {
    println!("{icon} {}: {value}", label.style(theme().dim.clone()));
}

pub fn success(text: &str) {
    println!("{} {}", Icons::CHECK, text.style(theme().success.clone()));
}

pub fn error(text: &str) {
    eprintln!("{} {}", Icons::CROSS, text.style(theme().error.clone()));
}

pub fn section(title: &str) {
    println!();
    println!("{}", title.style(theme().header.clone()));
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {} {value}", label.style(theme().dim.clone()));
}

pub fn file_deleted(path: &str) {
    println!("{} {}", Icons::DEL, path.style(theme().dim.clone()));
}

/// `1536 -> "1.5 KB"`. Decimal units, one decimal past bytes.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
