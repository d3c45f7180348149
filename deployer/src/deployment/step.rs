//! The step protocol.
//!
//! A deployment is a sequence of steps. Each step describes itself, then
//! streams log entries into the deployment's persisted log while it runs;
//! entries are committed as they arrive so a crash leaves a partial but
//! consistent trail. Emitting an `error` entry marks the step failed once it
//! finishes; returning an error fails it immediately.

use async_trait::async_trait;
use slipway_common::models::{LogEntry, Severity};
use tracing::{error, info, warn};

use crate::dal::{Dal, DalError};
use crate::exec::CommandOutput;
use crate::haproxy::HaproxyError;
use crate::mirror::GitError;
use crate::notification::mail::Mail;

#[derive(thiserror::Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Dal(#[from] DalError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Haproxy(#[from] HaproxyError),
    #[error("{0}")]
    Failed(String),
}

/// Log sink handed to a running step. Tracks whether any error-severity entry
/// went through.
pub struct StepContext<D> {
    dal: D,
    deploy_id: i64,
    errored: bool,
}

impl<D: Dal> StepContext<D> {
    pub(crate) fn new(dal: D, deploy_id: i64) -> Self {
        Self {
            dal,
            deploy_id,
            errored: false,
        }
    }

    pub fn deploy_id(&self) -> i64 {
        self.deploy_id
    }

    pub fn dal(&self) -> &D {
        &self.dal
    }

    pub(crate) fn errored(&self) -> bool {
        self.errored
    }

    pub async fn log(&mut self, entry: LogEntry) -> Result<(), StepError> {
        match entry.severity {
            Severity::Info => info!(deploy_id = self.deploy_id, "{}", entry.message),
            Severity::Warn => warn!(deploy_id = self.deploy_id, "{}", entry.message),
            Severity::Error => {
                error!(deploy_id = self.deploy_id, "{}", entry.message);
                self.errored = true;
            }
        }
        self.dal.append_log(self.deploy_id, &entry).await?;
        Ok(())
    }

    pub async fn info(&mut self, message: impl Into<String>) -> Result<(), StepError> {
        self.log(LogEntry::new(message)).await
    }

    pub async fn warn(&mut self, message: impl Into<String>) -> Result<(), StepError> {
        self.log(LogEntry::warn(message)).await
    }

    pub async fn error(&mut self, message: impl Into<String>) -> Result<(), StepError> {
        self.log(LogEntry::error(message)).await
    }

    /// Log a command's output. Non-zero exit turns the stderr into an error
    /// entry and adds an exit-code entry, which fails the step.
    pub async fn capture(
        &mut self,
        prefix: &str,
        output: &CommandOutput,
    ) -> Result<(), StepError> {
        for entry in capture_entries(prefix, output) {
            self.log(entry).await?;
        }
        Ok(())
    }
}

/// The [`StepContext::capture`] rendering, reusable where entries are
/// collected off-context (the parallel sync workers).
pub fn capture_entries(prefix: &str, output: &CommandOutput) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    if !output.stdout.is_empty() {
        entries.push(LogEntry::new(format!("{}: {}", prefix, output.stdout)));
    }
    if !output.stderr.is_empty() {
        let entry = format!("{}: {}", prefix, output.stderr);
        if output.exit_code != 0 {
            entries.push(LogEntry::error(entry));
        } else {
            entries.push(LogEntry::warn(entry));
        }
    }
    if output.exit_code != 0 {
        entries.push(LogEntry::error(format!(
            "{}: exited with code {}",
            prefix, output.exit_code
        )));
    }
    entries
}

#[async_trait]
pub trait Step: Send {
    type Output: Send;

    /// One line for the log and the step_start/step_end notifications.
    fn describe(&self) -> String;

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<Self::Output, StepError>;
}

/// Mail queue handle plus the envelope fields steps need to report test
/// failures.
#[derive(Clone)]
pub struct TestMailing {
    pub tx: tokio::sync::mpsc::Sender<Mail>,
    pub report_to: Vec<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn capture_renders_severities_by_exit_code() {
        let ok = CommandOutput {
            exit_code: 0,
            stdout: "done".into(),
            stderr: "careful".into(),
        };
        let entries = capture_entries("rsync", &ok);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].severity, Severity::Info);
        assert_eq!(entries[1].severity, Severity::Warn);

        let failed = CommandOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "boom".into(),
        };
        let entries = capture_entries("rsync", &failed);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].severity, Severity::Error);
        assert_eq!(entries[1].message, "rsync: exited with code 2");
    }
}
