//! Per-run scratch directory for build artifacts.
//!
//! Configurations usually build into `./tmp/`. Each run gets its own randomly
//! named directory under `<system temp>/hotrack/` instead, so concurrent runs
//! never overwrite each other's binaries and nothing is left in the project.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::process::{AppSpec, RunTarget};

const SESSION_ROOT: &str = "hotrack";
const PROJECT_TMP: &str = "./tmp";

pub struct SessionWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl SessionWorkspace {
    /// Creates a fresh session directory under the system temp directory.
    pub fn create() -> io::Result<Self> {
        Self::create_in(&std::env::temp_dir().join(SESSION_ROOT))
    }

    pub fn create_in(parent: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new().prefix("session-").tempdir_in(parent)?;
        let path = dir.path().to_path_buf();
        log::debug!("session directory {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Points every `./tmp/` reference in `spec` at the session directory.
    pub fn translate(&self, spec: &mut AppSpec) {
        let session = format!("{}/", self.path.display());
        let project = format!("{}/", PROJECT_TMP);

        if let Some(build) = spec.build.as_mut() {
            build.substitute(&project, &session);
        }
        match spec.run.as_mut() {
            Some(RunTarget::Binary { path, .. }) => {
                if let Some(rest) = path.strip_prefix(&project) {
                    *path = format!("{}{}", session, rest);
                }
            }
            Some(RunTarget::CommandLine(line)) => line.substitute(&project, &session),
            None => {}
        }
        if let Some(tmp_dir) = spec.tmp_dir.as_mut() {
            let in_project = tmp_dir
                .to_str()
                .is_some_and(|text| text == PROJECT_TMP || text == project);
            if in_project {
                *tmp_dir = self.path.clone();
            }
        }
    }

    /// Removes the directory and everything in it. Later calls do nothing.
    pub fn close(&mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}
