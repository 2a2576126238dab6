use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use dagwright_core::{DagError, Node, Payload, Result, STDIN_KEY};

/// Default command timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a shell command through `sh -c`.
///
/// A `stdin` input (a string, or an array of byte values) is written to the
/// child's standard input. Output is `{stdout, stderr, returncode, success}`
/// with trailing newlines trimmed. A timeout kills the child and is reported
/// as a failed output, not an error.
pub struct CommandNode {
    id: String,
    command: String,
    timeout: Duration,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl CommandNode {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            timeout: DEFAULT_TIMEOUT,
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn stdin_bytes(&self, input: &Payload) -> Result<Option<Vec<u8>>> {
        match input.get(STDIN_KEY) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_bytes().to_vec())),
            Some(Value::Array(values)) => values
                .iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| self.bad_stdin(v))
                })
                .collect::<Result<Vec<u8>>>()
                .map(Some),
            Some(other) => Err(self.bad_stdin(other)),
        }
    }

    fn bad_stdin(&self, value: &Value) -> DagError {
        DagError::InvalidInput(format!(
            "node '{}': stdin must be a string or an array of bytes, got {}",
            self.id, value
        ))
    }

    async fn run(&self, stdin: Option<Vec<u8>>) -> Result<Payload> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| DagError::NodeExecution {
            node: self.id.clone(),
            message: format!("failed to spawn command: {}", e),
        })?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let node_id = self.id.clone();
            tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is not a failure.
                if let Err(e) = pipe.write_all(&bytes).await {
                    debug!(node_id = %node_id, error = %e, "stdin write interrupted");
                }
            });
        }

        // Dropping the child on timeout kills it.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let code = output.status.code();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                Ok(output_payload(
                    stdout.trim_end_matches('\n'),
                    stderr.trim_end_matches('\n'),
                    code.map_or(Value::Null, |c| json!(c)),
                    code == Some(0),
                ))
            }
            Ok(Err(e)) => Err(DagError::NodeExecution {
                node: self.id.clone(),
                message: e.to_string(),
            }),
            Err(_) => {
                let secs = self.timeout.as_secs_f64();
                warn!(node_id = %self.id, timeout_secs = secs, "Command timed out");
                Ok(output_payload(
                    "",
                    &format!("Command timed out after {} seconds", secs),
                    Value::Null,
                    false,
                ))
            }
        }
    }
}

fn output_payload(stdout: &str, stderr: &str, returncode: Value, success: bool) -> Payload {
    let mut out = Payload::new();
    out.insert("stdout".into(), json!(stdout));
    out.insert("stderr".into(), json!(stderr));
    out.insert("returncode".into(), returncode);
    out.insert("success".into(), json!(success));
    out
}

impl Node for CommandNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "unix"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let stdin = self.stdin_bytes(&input)?;
            debug!(node_id = %self.id, command = %self.command, "Executing command");
            self.run(stdin).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagwright_test_utils::payload;

    #[tokio::test]
    async fn test_echo_trims_trailing_newline() {
        let out = CommandNode::new("c", "echo hello")
            .execute(Payload::new())
            .await
            .unwrap();
        assert_eq!(out["stdout"], json!("hello"));
        assert_eq!(out["stderr"], json!(""));
        assert_eq!(out["returncode"], json!(0));
        assert_eq!(out["success"], json!(true));
    }

    #[tokio::test]
    async fn test_stdin_string_piped() {
        let out = CommandNode::new("c", "tr a-z A-Z")
            .execute(payload(json!({"stdin": "shout"})))
            .await
            .unwrap();
        assert_eq!(out["stdout"], json!("SHOUT"));
    }

    #[tokio::test]
    async fn test_stdin_bytes_piped() {
        let out = CommandNode::new("c", "cat")
            .execute(payload(json!({"stdin": [104, 105]})))
            .await
            .unwrap();
        assert_eq!(out["stdout"], json!("hi"));
    }

    #[tokio::test]
    async fn test_invalid_stdin_is_error() {
        let err = CommandNode::new("c", "cat")
            .execute(payload(json!({"stdin": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, DagError::InvalidInput(_)));

        let err = CommandNode::new("c", "cat")
            .execute(payload(json!({"stdin": [1, 300]})))
            .await
            .unwrap_err();
        assert!(matches!(err, DagError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let out = CommandNode::new("c", "echo oops >&2; exit 3")
            .execute(Payload::new())
            .await
            .unwrap();
        assert_eq!(out["returncode"], json!(3));
        assert_eq!(out["success"], json!(false));
        assert_eq!(out["stderr"], json!("oops"));
    }

    #[tokio::test]
    async fn test_timeout_is_recovered_failure() {
        let out = CommandNode::new("slow", "sleep 5")
            .with_timeout(Duration::from_millis(100))
            .execute(Payload::new())
            .await
            .unwrap();
        assert_eq!(out["stdout"], json!(""));
        assert_eq!(out["returncode"], Value::Null);
        assert_eq!(out["success"], json!(false));
        assert_eq!(
            out["stderr"],
            json!("Command timed out after 0.1 seconds")
        );
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = CommandNode::new("c", "echo \"$GREETING\" && pwd")
            .with_env("GREETING", "hey")
            .with_working_dir(dir.path())
            .execute(Payload::new())
            .await
            .unwrap();
        let stdout = out["stdout"].as_str().unwrap();
        assert!(stdout.starts_with("hey\n"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(stdout.ends_with(canonical.file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_no_stdin_reads_nothing() {
        let out = CommandNode::new("c", "cat")
            .execute(Payload::new())
            .await
            .unwrap();
        assert_eq!(out["stdout"], json!(""));
        assert_eq!(out["success"], json!(true));
    }
}
