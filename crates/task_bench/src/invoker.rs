//! Invocation boundary: every RPC goes through the external `grpcurl` relay.
//!
//! The harness deliberately does not carry its own gRPC stack; it shells out
//! to `grpcurl` for unary, client-streaming, and server-streaming calls and
//! classifies the outcome from the child's exit status and stderr. A call is
//! successful only when the relay exits zero *and* wrote nothing to stderr.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Relay binary used for all calls.
const GRPCURL_BIN: &str = "grpcurl";

/// Failed invocation: exit code, terminating signal (if any), and captured
/// diagnostics, kept distinct so callers can classify and log them separately.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invocation failed (code={code:?} signal={signal:?}): {stderr}")]
pub struct InvokeError {
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub stderr: String,
}

impl InvokeError {
    /// Build an error for a call that never produced an exit status
    /// (spawn failure, broken pipe while feeding stdin, and the like).
    pub fn internal(diagnostics: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: None,
            stderr: diagnostics.into(),
        }
    }
}

/// Single-call surface the rest of the harness consumes.
///
/// Implemented by [`GrpcurlInvoker`] in production and by in-memory fakes in
/// tests; both the scheduler and the verifier only ever see this trait.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// One unary request with a JSON payload; returns raw response text.
    async fn unary(&self, method: &str, payload: serde_json::Value)
    -> Result<String, InvokeError>;

    /// One client-streaming request; `body` is written to the relay's stdin
    /// verbatim (plus a trailing newline) so a duplicate submission can reuse
    /// the byte-identical request.
    async fn client_stream(&self, method: &str, body: &str) -> Result<String, InvokeError>;

    /// Reflection listing of the services exposed by the target.
    async fn reflect_list(&self) -> Result<String, InvokeError>;

    /// Open a server stream and return the first complete JSON message,
    /// killing the relay afterwards. `wait` bounds a stream that never emits.
    async fn server_stream_first(
        &self,
        method: &str,
        payload: serde_json::Value,
        wait: Duration,
    ) -> Result<String, InvokeError>;
}

/// Production invoker: spawns `grpcurl -plaintext` against a fixed target.
#[derive(Debug, Clone)]
pub struct GrpcurlInvoker {
    target: String,
}

impl GrpcurlInvoker {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    async fn run(&self, args: &[&str], stdin_body: Option<&str>) -> Result<String, InvokeError> {
        let mut cmd = Command::new(GRPCURL_BIN);
        cmd.args(args)
            .stdin(if stdin_body.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| InvokeError::internal(format!("spawn {GRPCURL_BIN}: {err}")))?;

        if let Some(body) = stdin_body {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| InvokeError::internal("child stdin not captured"))?;
            stdin
                .write_all(body.as_bytes())
                .await
                .map_err(|err| InvokeError::internal(format!("write request body: {err}")))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|err| InvokeError::internal(format!("write request body: {err}")))?;
            // Dropping stdin closes the pipe and lets the relay finish the stream.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| InvokeError::internal(format!("wait for {GRPCURL_BIN}: {err}")))?;

        classify_output(
            output.status.code(),
            exit_signal(&output.status),
            &output.stdout,
            &output.stderr,
        )
    }
}

#[async_trait]
impl Invoker for GrpcurlInvoker {
    async fn unary(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<String, InvokeError> {
        let data = payload.to_string();
        self.run(&["-plaintext", "-d", &data, &self.target, method], None)
            .await
    }

    async fn client_stream(&self, method: &str, body: &str) -> Result<String, InvokeError> {
        self.run(
            &["-plaintext", "-d", "@", &self.target, method],
            Some(body),
        )
        .await
    }

    async fn reflect_list(&self) -> Result<String, InvokeError> {
        self.run(&["-plaintext", &self.target, "list"], None).await
    }

    async fn server_stream_first(
        &self,
        method: &str,
        payload: serde_json::Value,
        wait: Duration,
    ) -> Result<String, InvokeError> {
        let data = payload.to_string();
        let mut child = Command::new(GRPCURL_BIN)
            .args(["-plaintext", "-d", &data, &self.target, method])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| InvokeError::internal(format!("spawn {GRPCURL_BIN}: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InvokeError::internal("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| InvokeError::internal("child stderr not captured"))?;

        // Drain stderr concurrently so a chatty relay cannot block on a full
        // pipe while we wait on stdout.
        let drain = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut stderr = stderr;
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        // grpcurl pretty-prints one JSON object across several lines; read
        // until the accumulated text parses as a complete value.
        let mut message = String::new();
        let read_first = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                message.push_str(&line);
                message.push('\n');
                if serde_json::from_str::<serde_json::Value>(&message).is_ok() {
                    break;
                }
            }
            Ok::<_, std::io::Error>(())
        };
        let outcome = match tokio::time::timeout(wait, read_first).await {
            Ok(read) => Some(read),
            Err(_) => None,
        };

        let _ = child.kill().await;
        let _ = child.wait().await;
        let diagnostics = drain.await.unwrap_or_default();

        finish_stream_first(outcome, message, &diagnostics, wait)
    }
}

/// Fold the stream-read outcome and any relay diagnostics into the call
/// result (`None` outcome means the wait elapsed first).
fn finish_stream_first(
    outcome: Option<Result<(), std::io::Error>>,
    message: String,
    diagnostics: &str,
    wait: Duration,
) -> Result<String, InvokeError> {
    let message = message.trim();
    match outcome {
        Some(Ok(())) if !message.is_empty() => Ok(message.to_string()),
        Some(Ok(())) => Err(stream_error("stream closed before first message", diagnostics)),
        Some(Err(err)) => Err(stream_error(&format!("read stream: {err}"), diagnostics)),
        None => Err(stream_error(
            &format!("no stream message within {}ms", wait.as_millis()),
            diagnostics,
        )),
    }
}

fn stream_error(reason: &str, diagnostics: &str) -> InvokeError {
    let diagnostics = diagnostics.trim();
    InvokeError::internal(if diagnostics.is_empty() {
        reason.to_string()
    } else {
        format!("{reason}: {diagnostics}")
    })
}

/// Map an exit status and captured output to the invoker result contract.
fn classify_output(
    code: Option<i32>,
    signal: Option<String>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<String, InvokeError> {
    let diagnostics = String::from_utf8_lossy(stderr).trim().to_string();
    if code == Some(0) && diagnostics.is_empty() {
        Ok(String::from_utf8_lossy(stdout).trim().to_string())
    } else {
        Err(InvokeError {
            code,
            signal,
            stderr: diagnostics,
        })
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(signal_name)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// Human-readable name for the signals a relay child realistically dies from.
#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}
