//! Helpers to run commands on local and remote hosts.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use slipway_common::models::Server;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// What is needed to reach a server over SSH.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub username: String,
    pub port: i64,
}

impl Host {
    pub fn new(name: impl Into<String>, username: impl Into<String>, port: i64) -> Self {
        Self {
            name: name.into(),
            username: username.into(),
            port,
        }
    }

    pub fn from_server(server: &Server, username: &str) -> Self {
        Self::new(&server.name, username, server.port)
    }

    pub fn user_at(&self) -> String {
        format!("{}@{}", self.username, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    fn failure(message: String) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: message,
        }
    }
}

/// Execute a command on the local machine.
///
/// Both output streams are captured while the child runs. If the timeout is
/// exceeded the child is killed and the call reports exit code 1, with the
/// partial output captured so far and a `Timeout` marker on stderr.
pub async fn exec_cmd(argv: &[String], cwd: Option<&Path>, timeout: Duration) -> CommandOutput {
    let Some((program, args)) = argv.split_first() else {
        return CommandOutput::failure("empty command".into());
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(cmd = ?argv, error = %e, "could not spawn command");
            return CommandOutput::failure(e.to_string());
        }
    };

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));

    let stdout_task = child.stdout.take().map(|pipe| spawn_reader(pipe, stdout_buf.clone()));
    let stderr_task = child.stderr.take().map(|pipe| spawn_reader(pipe, stderr_buf.clone()));

    let status = tokio::time::timeout(timeout, child.wait()).await;

    let (exit_code, timed_out) = match status {
        Ok(Ok(status)) => (status.code().unwrap_or(1), false),
        Ok(Err(e)) => {
            error!(cmd = ?argv, error = %e, "error waiting for command");
            (1, false)
        }
        Err(_elapsed) => {
            let _ = child.kill().await;
            (1, true)
        }
    };

    for task in [stdout_task, stderr_task].into_iter().flatten() {
        let _ = task.await;
    }

    let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
    let mut stderr = String::from_utf8_lossy(&stderr_buf.lock().await).into_owned();

    if timed_out {
        error!(cmd = ?argv, stdout, stderr, "command timed out");
        stderr = format!(
            "Timeout (the command took more than {}s to return)\n\n{}",
            timeout.as_secs(),
            stderr
        );
    } else {
        debug!(cmd = ?argv, exit_code, "command finished");
    }

    CommandOutput {
        exit_code,
        stdout,
        stderr,
    }
}

fn spawn_reader(
    mut pipe: impl AsyncReadExt + Unpin + Send + 'static,
    buffer: Arc<Mutex<Vec<u8>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// Run a command on a remote host through SSH.
pub async fn run_cmd_by_ssh(host: &Host, cmd: &[String], timeout: Duration) -> CommandOutput {
    let mut full_cmd = vec![
        "ssh".to_owned(),
        host.user_at(),
        "-p".to_owned(),
        host.port.to_string(),
    ];
    full_cmd.extend(cmd.iter().cloned());
    exec_cmd(&full_cmd, None, timeout).await
}

/// Run a local shell script if it exists. A missing script is not an error.
pub async fn exec_script(
    working_directory: &Path,
    script_name: &str,
    params: &[String],
) -> CommandOutput {
    if !working_directory.join(script_name).exists() {
        return CommandOutput {
            exit_code: 0,
            stdout: format!("No script '{script_name}'."),
            stderr: String::new(),
        };
    }
    let mut cmd = vec!["bash".to_owned(), script_name.to_owned()];
    cmd.extend(params.iter().cloned());
    exec_cmd(&cmd, Some(working_directory), DEFAULT_TIMEOUT).await
}

/// Whether `stat <path>` exits 0 on the remote host.
pub async fn remote_check_file_exists(path: &str, host: &Host) -> bool {
    let cmd = vec!["stat".to_owned(), path.to_owned()];
    run_cmd_by_ssh(host, &cmd, DEFAULT_TIMEOUT).await.exit_code == 0
}

/// Run a script sitting on a remote host, if it exists there.
pub async fn exec_script_remote(
    host: &Host,
    remote_working_directory: &str,
    script_name: &str,
    params: &[String],
) -> CommandOutput {
    let script_path = format!("{}/{}", remote_working_directory.trim_end_matches('/'), script_name);
    if !remote_check_file_exists(&script_path, host).await {
        return CommandOutput {
            exit_code: 0,
            stdout: format!("No remote script '{script_name}'"),
            stderr: String::new(),
        };
    }
    let mut cmd = vec![
        "cd".to_owned(),
        remote_working_directory.to_owned(),
        "&&".to_owned(),
        "bash".to_owned(),
        script_name.to_owned(),
    ];
    cmd.extend(params.iter().cloned());
    run_cmd_by_ssh(host, &cmd, DEFAULT_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = exec_cmd(&argv(&["echo", "hello"]), None, DEFAULT_TIMEOUT).await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "");
    }

    #[tokio::test]
    async fn captures_stderr_separately() {
        let out = exec_cmd(
            &argv(&["bash", "-c", "echo out; echo err >&2; exit 3"]),
            None,
            DEFAULT_TIMEOUT,
        )
        .await;
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_marks_stderr() {
        let out = exec_cmd(
            &argv(&["bash", "-c", "echo early; sleep 30"]),
            None,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(out.exit_code, 1);
        assert!(out.stderr.starts_with("Timeout (the command took more than 1s"));
        assert_eq!(out.stdout, "early\n", "partial output is kept");
    }

    #[tokio::test]
    async fn unknown_binary_reports_failure_not_panic() {
        let out = exec_cmd(&argv(&["definitely-not-a-binary-zz"]), None, DEFAULT_TIMEOUT).await;
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn missing_script_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let out = exec_script(dir.path(), "predeploy.sh", &[]).await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "No script 'predeploy.sh'.");
    }

    #[tokio::test]
    async fn present_script_runs_with_params() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("predeploy.sh"), "echo \"env=$1\"").unwrap();
        let out = exec_script(dir.path(), "predeploy.sh", &argv(&["prod"])).await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "env=prod\n");
    }

    #[test]
    fn host_formats_ssh_destination() {
        let host = Host::new("web-1", "deploy", 2222);
        assert_eq!(host.user_at(), "deploy@web-1");
    }
}
