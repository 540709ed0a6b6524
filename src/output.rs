//! Console output for supervised applications.
//!
//! Application stdout is printed with an `[name]` prefix, optionally colored
//! per application. Stderr lines and lifecycle messages go through `log` so they
//! share the logger's timestamp and level formatting.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use strip_ansi_escapes::strip;

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

const PALETTE: [&str; 6] = ["cyan", "green", "yellow", "magenta", "blue", "red"];

/// Indicates the source stream of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Enables or disables ANSI colors for everything printed afterwards.
pub fn set_colors(enabled: bool) {
    COLORS_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Picks a palette color for the `index`-th application.
pub fn palette_color(index: usize) -> &'static str {
    PALETTE[index % PALETTE.len()]
}

/// Prints application output with a per-application prefix.
#[derive(Debug, Clone)]
pub struct Console {
    name: String,
    color: Option<String>,
}

impl Console {
    pub fn new(name: &str, color: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            color: color.map(str::to_string),
        }
    }

    pub fn prefix(&self) -> String {
        let prefix = format!("[{}]", self.name);
        if colors_enabled() {
            apply_color(&prefix, self.color.as_deref())
        } else {
            prefix
        }
    }

    /// Emits one line of process output.
    pub fn line(&self, stream: StreamKind, line: &str) {
        let text = sanitize_text(line, !colors_enabled());
        match stream {
            StreamKind::Stdout => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{} {}", self.prefix(), text);
            }
            StreamKind::Stderr => log::warn!("[{}] {}", self.name, text),
        }
    }

    /// Emits captured hook/build output, one log record per line.
    pub fn captured(&self, output: &str) {
        for line in output.lines().filter(|line| !line.trim().is_empty()) {
            log::info!("[{}] {}", self.name, sanitize_text(line, !colors_enabled()));
        }
    }
}

/// Removes ANSI escape codes when `strip_ansi` is set. Invalid UTF-8 is replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}
