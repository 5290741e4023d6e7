//! Environment checks run before the first request.
//!
//! All checks run; every problem is reported, not just the first.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::audio::Decoder;
use crate::backend::{BackendError, WorkerCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Some inputs will not work (e.g. non-WAV references without ffmpeg)
    Warning,
    /// Nothing will work until this is fixed
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightIssue {
    pub severity: Severity,
    pub component: &'static str,
    pub message: String,
}

impl PreflightIssue {
    fn error(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            component,
            message: message.into(),
        }
    }

    fn warning(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            component,
            message: message.into(),
        }
    }
}

/// How the model is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerTarget {
    /// In-process backend; nothing to look up
    InProcess,
    Command(WorkerCommand),
    /// A worker is needed but no command was given
    Unconfigured,
}

/// What to check.
#[derive(Debug, Clone)]
pub struct PreflightTargets {
    pub ffmpeg_path: String,
    pub worker: WorkerTarget,
    pub output_dir: PathBuf,
}

/// Run every check. `accelerator_check` asks the backend whether the
/// configured accelerator works.
pub fn run(
    targets: &PreflightTargets,
    accelerator_check: impl FnOnce() -> Result<(), BackendError>,
) -> Vec<PreflightIssue> {
    let mut issues = Vec::new();

    if !Decoder::new(targets.ffmpeg_path.clone()).is_available() {
        issues.push(PreflightIssue::warning(
            "ffmpeg",
            format!(
                "'{}' not found; only WAV reference audio can be used",
                targets.ffmpeg_path
            ),
        ));
    }

    let worker_ok = match &targets.worker {
        WorkerTarget::Command(worker) if find_program(&worker.program).is_none() => {
            issues.push(PreflightIssue::error(
                "worker",
                format!("worker program '{}' not found", worker.program.display()),
            ));
            false
        }
        WorkerTarget::Unconfigured => {
            issues.push(PreflightIssue::error("worker", "no model worker command configured"));
            false
        }
        _ => true,
    };

    if worker_ok {
        if let Err(e) = accelerator_check() {
            issues.push(PreflightIssue::error("accelerator", e.to_string()));
        }
    }

    if let Err(message) = check_writable(&targets.output_dir) {
        issues.push(PreflightIssue::error("output", message));
    }

    for issue in &issues {
        match issue.severity {
            Severity::Error => tracing::error!("preflight [{}]: {}", issue.component, issue.message),
            Severity::Warning => tracing::warn!("preflight [{}]: {}", issue.component, issue.message),
        }
    }
    issues
}

pub fn has_errors(issues: &[PreflightIssue]) -> bool {
    issues.iter().any(|i| i.severity == Severity::Error)
}

/// Resolve a program the way `Command` would: paths as-is, bare names through `PATH`.
fn find_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn check_writable(dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
    tempfile::NamedTempFile::new_in(dir)
        .map(|_| ())
        .map_err(|e| format!("{} is not writable: {e}", dir.display()))
}
