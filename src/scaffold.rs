//! `hotrack init`: generates a starter `hotrack.toml` for the current project.
//!
//! Go modules get one application per `cmd/*` entry point (or one for the
//! module root), Cargo packages get a cargo build into the scratch directory,
//! and anything else gets a generic make-based template to edit.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::DEFAULT_CONFIG_FILE;

const GENERIC_NAME: &str = "app";

/// What kind of project was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectKind {
    Go {
        module: Option<String>,
        /// Entry points below `cmd/`, relative to the project root.
        cmd_dirs: Vec<String>,
    },
    Cargo,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub kind: ProjectKind,
    pub watch_dirs: Vec<String>,
}

/// Inspects `dir` and describes the project found there.
pub fn analyze(dir: &Path) -> Result<Project> {
    let absolute = dir
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", dir.display()))?;
    let dir_name = absolute
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(GENERIC_NAME)
        .to_string();

    let go_mod = absolute.join("go.mod");
    if go_mod.is_file() {
        return analyze_go(&absolute, &go_mod, dir_name);
    }

    let cargo_toml = absolute.join("Cargo.toml");
    if cargo_toml.is_file() {
        let raw = std::fs::read_to_string(&cargo_toml)
            .with_context(|| format!("failed to read {}", cargo_toml.display()))?;
        let manifest: toml::Table = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", cargo_toml.display()))?;
        let package = manifest
            .get("package")
            .and_then(|package| package.get("name"))
            .and_then(|name| name.as_str());
        if let Some(package) = package {
            return Ok(Project {
                name: package.to_string(),
                kind: ProjectKind::Cargo,
                watch_dirs: vec![".".to_string()],
            });
        }
    }

    Ok(Project {
        name: dir_name,
        kind: ProjectKind::Generic,
        watch_dirs: vec![".".to_string()],
    })
}

fn analyze_go(root: &Path, go_mod: &Path, dir_name: String) -> Result<Project> {
    let raw = std::fs::read_to_string(go_mod)
        .with_context(|| format!("failed to read {}", go_mod.display()))?;
    let module = raw
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("module "))
        .map(|module| module.trim().to_string())
        .filter(|module| !module.is_empty());
    let name = module
        .as_deref()
        .and_then(|module| module.rsplit('/').next())
        .filter(|last| !last.is_empty() && *last != ".")
        .map(str::to_string)
        .unwrap_or(dir_name);

    let mut cmd_dirs = Vec::new();
    let cmd_root = root.join("cmd");
    if cmd_root.is_dir() {
        let entries = std::fs::read_dir(&cmd_root)
            .with_context(|| format!("failed to list {}", cmd_root.display()))?;
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(sub) = entry.file_name().to_str() {
                    cmd_dirs.push(format!("cmd/{}", sub));
                }
            }
        }
        cmd_dirs.sort();
    }

    let watch_dirs = if !cmd_dirs.is_empty() {
        cmd_dirs.iter().map(|dir| format!("./{}", dir)).collect()
    } else if cmd_root.is_dir() {
        vec!["./cmd".to_string()]
    } else {
        vec![".".to_string()]
    };
    Ok(Project {
        name,
        kind: ProjectKind::Go { module, cmd_dirs },
        watch_dirs,
    })
}

/// Renders a `hotrack.toml` for `project`.
pub fn render_config(project: &Project) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# {} - {}",
        DEFAULT_CONFIG_FILE,
        project.name.replace(['\n', '\r'], " ")
    );
    let _ = writeln!(out, "# Generated by hotrack init - customize as needed");

    match &project.kind {
        ProjectKind::Go { cmd_dirs, .. } if !cmd_dirs.is_empty() => {
            for cmd_dir in cmd_dirs {
                let app = cmd_dir.rsplit('/').next().unwrap_or(cmd_dir);
                let build = format!("go build -o ./tmp/{} ./{}", app, cmd_dir);
                let watch = format!("./{}", cmd_dir);
                render_go_app(&mut out, app, &build, &watch);
            }
        }
        ProjectKind::Go { .. } => {
            let build = format!("go build -o ./tmp/{} .", project.name);
            render_go_app(&mut out, &project.name, &build, ".");
        }
        ProjectKind::Cargo => {
            let _ = writeln!(out);
            let _ = writeln!(out, "[{}]", table_key(&project.name));
            let _ = writeln!(out, "  cmd = \"cargo build --target-dir ./tmp/target\"");
            let bin = format!("./tmp/target/debug/{}", project.name);
            let _ = writeln!(out, "  bin = {}", toml_string(&bin));
            let _ = writeln!(out, "  args = []");
            let _ = writeln!(out, "  watch_dir = \".\"");
            let _ = writeln!(out, "  tmp_dir = \"./tmp\"");
            let _ = writeln!(out, "  delay = 1000");
            let _ = writeln!(out, "  exclude_dir = [\"target\", \"tmp\", \".git\"]");
            let _ = writeln!(out, "  exclude_file = [\"*.log\"]");
            let _ = writeln!(out, "  clean_on_exit = true");
            let _ = writeln!(out, "  env = {{ RUST_LOG = \"info\" }}");
        }
        ProjectKind::Generic => {
            let _ = writeln!(out);
            let _ = writeln!(out, "# Adjust the build and run commands for this project.");
            let _ = writeln!(out, "[{}]", table_key(&project.name));
            let _ = writeln!(out, "  cmd = \"make build\"");
            let _ = writeln!(out, "  run_cmd = \"make run\"");
            let _ = writeln!(out, "  watch_dir = \".\"");
            let _ = writeln!(out, "  delay = 1000");
            let _ = writeln!(out, "  exclude_dir = [\"tmp\", \".git\"]");
            let _ = writeln!(out, "  exclude_file = [\"*.log\"]");
        }
    }
    out
}

fn render_go_app(out: &mut String, app: &str, build: &str, watch_dir: &str) {
    let _ = writeln!(out);
    let _ = writeln!(out, "[{}]", table_key(app));
    let _ = writeln!(out, "  cmd = {}", toml_string(build));
    let _ = writeln!(out, "  bin = {}", toml_string(&format!("./tmp/{}", app)));
    let _ = writeln!(out, "  args = []");
    let _ = writeln!(out, "  watch_dir = {}", toml_string(watch_dir));
    let _ = writeln!(out, "  tmp_dir = \"./tmp\"");
    let _ = writeln!(out, "  delay = 1000");
    let _ = writeln!(out, "  exclude_dir = [\"vendor\", \"tmp\", \"testdata\", \".git\"]");
    let _ = writeln!(out, "  exclude_file = [\"*_test.go\", \"*.log\"]");
    let _ = writeln!(out, "  clean_on_exit = true");
    if matches!(app, "api" | "server" | "web") {
        let _ = writeln!(out, "  env = {{ PORT = \"8080\" }}");
    } else {
        let _ = writeln!(out, "  env = {{}}");
    }
}

// Bare keys only allow ASCII letters, digits, '-' and '_'.
fn table_key(name: &str) -> String {
    let bare = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if bare {
        name.to_string()
    } else {
        toml_string(name)
    }
}

// A TOML string literal with any quotes or backslashes escaped.
fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

/// Human-readable description of what `init` detected.
pub fn summary(project: &Project) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Project: {}", project.name);
    match &project.kind {
        ProjectKind::Go { module, cmd_dirs } => {
            if let Some(module) = module {
                let _ = writeln!(out, "Go module: {}", module);
            }
            if !cmd_dirs.is_empty() {
                let _ = writeln!(out, "Commands found: {}", cmd_dirs.len());
                for dir in cmd_dirs {
                    let _ = writeln!(out, "  - {}", dir);
                }
            }
        }
        ProjectKind::Cargo => {
            let _ = writeln!(out, "Cargo package: {}", project.name);
        }
        ProjectKind::Generic => {
            let _ = writeln!(out, "No Go module or Cargo package detected");
        }
    }
    let _ = writeln!(out, "Watch directories: {}", project.watch_dirs.len());
    for dir in &project.watch_dirs {
        let _ = writeln!(out, "  - {}", dir);
    }
    out
}

/// Analyzes `dir` and writes its configuration to `target`.
///
/// An existing file is only replaced when `force` is set.
pub fn init(dir: &Path, target: &Path, force: bool) -> Result<Project> {
    if target.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            target.display()
        );
    }
    let project = analyze(dir)?;
    std::fs::write(target, render_config(&project))
        .with_context(|| format!("failed to write {}", target.display()))?;
    Ok(project)
}

/// Default location of the generated file inside `dir`.
pub fn default_target(dir: &Path) -> PathBuf {
    dir.join(DEFAULT_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{app_specs, parse_config};
    use crate::process::RunTarget;

    fn project_dir(name: &str) -> (tempfile::TempDir, PathBuf) {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join(name);
        std::fs::create_dir(&dir).unwrap();
        (parent, dir)
    }

    #[test]
    fn go_module_with_entry_points() {
        let (_parent, dir) = project_dir("checkout");
        std::fs::write(
            dir.join("go.mod"),
            "module github.com/acme/shop\n\ngo 1.22\n",
        )
        .unwrap();
        for sub in ["cmd/worker", "cmd/api"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }

        let project = analyze(&dir).unwrap();
        assert_eq!(project.name, "shop");
        assert_eq!(
            project.kind,
            ProjectKind::Go {
                module: Some("github.com/acme/shop".to_string()),
                cmd_dirs: vec!["cmd/api".to_string(), "cmd/worker".to_string()],
            }
        );
        assert_eq!(project.watch_dirs, vec!["./cmd/api", "./cmd/worker"]);

        let config = parse_config(&render_config(&project)).unwrap();
        let specs = app_specs(&config, Path::new("/srv/shop")).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "api");
        assert_eq!(specs[0].watch_dir, PathBuf::from("/srv/shop/cmd/api"));
        assert_eq!(
            specs[0].build.as_ref().unwrap().as_str(),
            "go build -o ./tmp/api ./cmd/api"
        );
        assert_eq!(
            specs[0].run,
            Some(RunTarget::Binary {
                path: "./tmp/api".to_string(),
                args: Vec::new(),
            })
        );
        assert!(specs[0].clean_on_exit);
        assert_eq!(specs[0].env.get("PORT").map(String::as_str), Some("8080"));
        assert!(specs[1].env.is_empty());

        let text = summary(&project);
        assert!(text.contains("Go module: github.com/acme/shop"));
        assert!(text.contains("Commands found: 2"));
    }

    #[cfg(unix)]
    #[test]
    fn entry_point_names_are_escaped() {
        let (_parent, dir) = project_dir("odd");
        std::fs::write(dir.join("go.mod"), "module example.com/odd\n").unwrap();
        let name = "we\"ird\\dir";
        std::fs::create_dir_all(dir.join("cmd").join(name)).unwrap();

        let project = analyze(&dir).unwrap();
        let config = parse_config(&render_config(&project)).unwrap();
        let app = &config.apps[name];
        assert_eq!(
            app.cmd.as_deref(),
            Some("go build -o ./tmp/we\"ird\\dir ./cmd/we\"ird\\dir")
        );
        assert_eq!(app.bin.as_deref(), Some("./tmp/we\"ird\\dir"));
        assert_eq!(app.watch_dir.as_deref(), Some("./cmd/we\"ird\\dir"));
    }

    #[test]
    fn go_module_at_root() {
        let (_parent, dir) = project_dir("tool");
        std::fs::write(dir.join("go.mod"), "module tool\n").unwrap();
        let project = analyze(&dir).unwrap();
        assert_eq!(project.watch_dirs, vec!["."]);

        let config = parse_config(&render_config(&project)).unwrap();
        let app = &config.apps["tool"];
        assert_eq!(app.cmd.as_deref(), Some("go build -o ./tmp/tool ."));
    }

    #[test]
    fn cargo_package() {
        let (_parent, dir) = project_dir("workspace");
        std::fs::write(
            dir.join("Cargo.toml"),
            "[package]\nname = \"ledger\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        let project = analyze(&dir).unwrap();
        assert_eq!(project.name, "ledger");
        assert_eq!(project.kind, ProjectKind::Cargo);

        let config = parse_config(&render_config(&project)).unwrap();
        assert_eq!(
            config.apps["ledger"].bin.as_deref(),
            Some("./tmp/target/debug/ledger")
        );
    }

    #[test]
    fn generic_fallback_quotes_odd_names() {
        let (_parent, dir) = project_dir("my site");
        let project = analyze(&dir).unwrap();
        assert_eq!(project.kind, ProjectKind::Generic);

        let config = parse_config(&render_config(&project)).unwrap();
        assert_eq!(config.apps["my site"].run_cmd.as_deref(), Some("make run"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let (_parent, dir) = project_dir("svc");
        let target = default_target(&dir);
        std::fs::write(&target, "# mine\n").unwrap();

        let err = init(&dir, &target, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "# mine\n");

        init(&dir, &target, true).unwrap();
        assert!(std::fs::read_to_string(&target).unwrap().contains("[svc]"));
    }
}
