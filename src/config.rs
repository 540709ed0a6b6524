//! Configuration management for hotrack.
//!
//! This module defines the structure of the `hotrack.toml` configuration file,
//! loads and parses it, and turns each application table into an `AppSpec`.
//!
//! Every top-level table is one application, keyed by its name:
//!
//! ```toml
//! [api]
//! build_cmd = "go build -o ./tmp/api ./cmd/api"
//! bin = "./tmp/api"
//! watch_dir = "./cmd/api"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::output::palette_color;
use crate::process::{AppSpec, CommandLine, ExcludeRules, RunTarget, Timings};
use crate::signals::Signal;

pub const DEFAULT_CONFIG_FILE: &str = "hotrack.toml";

const DEFAULT_START_DELAY_MS: u64 = 1000;
const DEFAULT_RERUN_DELAY_MS: u64 = 500;

/// Parsed `hotrack.toml`: application tables keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub apps: BTreeMap<String, AppConfig>,
}

/// Configuration for a single application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Command line to run after a build.
    pub run_cmd: Option<String>,
    /// Build command.
    pub build_cmd: Option<String>,
    /// Alias for `build_cmd`, used when that is empty.
    pub cmd: Option<String>,
    /// Binary to run; takes precedence over `run_cmd`.
    pub bin: Option<String>,
    /// Arguments passed to `bin`.
    pub args: Option<Vec<String>>,
    /// Directory to watch (default: ".").
    pub watch_dir: Option<String>,
    /// Working directory for hooks, build and run.
    pub cwd: Option<String>,
    /// Scratch directory removed by `clean_on_exit`.
    pub tmp_dir: Option<String>,
    /// Environment variables layered over the inherited environment.
    pub env: Option<HashMap<String, String>>,
    /// Delay before starting, in milliseconds (default: 1000).
    pub delay: Option<u64>,
    /// Delay after stopping, as a duration string such as "500ms".
    pub kill_delay: Option<String>,
    /// Start even if the build failed.
    pub rerun: Option<bool>,
    /// Delay before starting after a failed build, in milliseconds (default: 500).
    pub rerun_delay: Option<u64>,
    pub exclude_dir: Option<Vec<String>>,
    pub exclude_file: Option<Vec<String>>,
    pub exclude_regex: Option<Vec<String>>,
    pub follow_symlink: Option<bool>,
    /// Commands run before the build.
    pub pre_cmd: Option<Vec<String>>,
    /// Commands run after the build.
    pub post_cmd: Option<Vec<String>>,
    /// Stop with SIGINT instead of SIGTERM.
    pub send_interrupt: Option<bool>,
    pub stop_on_error: Option<bool>,
    pub log_silent: Option<bool>,
    pub clean_on_exit: Option<bool>,
    /// Color override for the app prefix.
    pub color: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        bail!("configuration file {} not found", path.display());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Parses configuration text. Top-level values that are not tables are ignored.
pub fn parse_config(raw: &str) -> Result<Config> {
    let table: toml::Table = toml::from_str(raw)?;
    let mut apps = BTreeMap::new();
    for (name, value) in table {
        if !value.is_table() {
            continue;
        }
        if name.trim().is_empty() {
            bail!("application names must not be empty");
        }
        let app: AppConfig = value
            .try_into()
            .with_context(|| format!("invalid settings for app '{}'", name))?;
        apps.insert(name, app);
    }
    Ok(Config { apps })
}

/// Builds a spec for every configured application, resolving relative paths
/// against `base_dir`.
pub fn app_specs(config: &Config, base_dir: &Path) -> Result<Vec<AppSpec>> {
    config
        .apps
        .iter()
        .enumerate()
        .map(|(index, (name, app))| app_spec_from_config(name, app, base_dir, index))
        .collect()
}

/// Applies defaults and converts one application table into an `AppSpec`.
pub fn app_spec_from_config(
    name: &str,
    app: &AppConfig,
    base_dir: &Path,
    index: usize,
) -> Result<AppSpec> {
    if name.trim().is_empty() {
        bail!("application names must not be empty");
    }

    let watch_dir = absolutize(base_dir, app.watch_dir.as_deref().unwrap_or("."));
    let mut spec = AppSpec::new(name, watch_dir);

    spec.run = match (non_blank(&app.bin), non_blank(&app.run_cmd)) {
        (Some(bin), _) => Some(RunTarget::Binary {
            path: bin.to_string(),
            args: app.args.clone().unwrap_or_default(),
        }),
        (None, Some(run)) => CommandLine::parse(run).map(RunTarget::CommandLine),
        (None, None) => None,
    };
    spec.build = non_blank(&app.build_cmd)
        .or_else(|| non_blank(&app.cmd))
        .and_then(CommandLine::parse);
    spec.cwd = non_blank(&app.cwd).map(|cwd| absolutize(base_dir, cwd));
    spec.tmp_dir = non_blank(&app.tmp_dir).map(PathBuf::from);
    spec.env = app.env.clone().unwrap_or_default();

    let kill_delay = match non_blank(&app.kill_delay) {
        Some(text) => Some(
            parse_duration(text)
                .with_context(|| format!("app '{}': invalid kill_delay", name))?,
        ),
        None => None,
    };
    spec.timings = Timings {
        start_delay: Duration::from_millis(app.delay.unwrap_or(DEFAULT_START_DELAY_MS)),
        kill_delay,
        rerun_delay: Duration::from_millis(app.rerun_delay.unwrap_or(DEFAULT_RERUN_DELAY_MS)),
    };

    spec.rerun = app.rerun.unwrap_or(false);
    spec.pre_cmds = hooks(&app.pre_cmd);
    spec.post_cmds = hooks(&app.post_cmd);
    spec.excludes = ExcludeRules {
        dirs: app.exclude_dir.clone().unwrap_or_default(),
        files: app.exclude_file.clone().unwrap_or_default(),
        regexes: app.exclude_regex.clone().unwrap_or_default(),
    };
    spec.follow_symlinks = app.follow_symlink.unwrap_or(false);
    spec.stop_signal = if app.send_interrupt.unwrap_or(false) {
        Signal::Interrupt
    } else {
        Signal::Terminate
    };
    spec.stop_on_error = app.stop_on_error.unwrap_or(false);
    spec.log_silent = app.log_silent.unwrap_or(false);
    spec.clean_on_exit = app.clean_on_exit.unwrap_or(false);
    spec.color = Some(
        app.color
            .clone()
            .unwrap_or_else(|| palette_color(index).to_string()),
    );
    Ok(spec)
}

/// Parses a duration such as `500ms`, `2s` or `1m30s`.
///
/// Units are `ns`, `us` (`µs`), `ms`, `s`, `m` and `h`; components may carry a
/// decimal fraction and are summed. A bare `0` is accepted.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        bail!("empty duration");
    }

    let mut total_nanos = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            bail!("invalid duration {:?}: expected a number", text);
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| anyhow!("invalid duration {:?}", text))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => bail!("invalid duration {:?}: missing unit", text),
            unit => bail!("invalid duration {:?}: unknown unit {:?}", text, unit),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn hooks(commands: &Option<Vec<String>>) -> Vec<CommandLine> {
    commands
        .iter()
        .flatten()
        .filter_map(|command| CommandLine::parse(command))
        .collect()
}

/// Joins `path` onto `base` when relative and removes `.`/`..` lexically.
fn absolutize(base: &Path, path: &str) -> PathBuf {
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        base.join(path)
    };
    let mut cleaned = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}
