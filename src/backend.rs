//! Model backends for a locally hosted model server.
//!
//! Two transports reach the same Ollama model: a JSON POST to the HTTP
//! generate endpoint, and an `ollama run` subprocess with explicit sampling
//! flags. Both implement [`ModelBackend`]; [`ModelCaller`] adds the bounded
//! retry policy and the degrade-to-empty behaviour the run driver relies on.

use crate::config::{BackendConfig, BackendKind, ExperimentConfig};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Poll interval while waiting on a CLI subprocess
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Typed failure of a single model call
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection to model server failed: {0}")]
    Connection(String),

    #[error("Model server returned HTTP {status}")]
    Http { status: u16 },

    #[error("Invalid response from model server: {0}")]
    InvalidResponse(String),

    #[error("Failed to launch model CLI: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Model CLI exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
}

impl CallError {
    /// Worth another attempt: timeouts, connection failures and 5xx replies
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Http { status } => *status >= 500,
            _ => false,
        }
    }
}

/// Decoding parameters sent with every prompt
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Nucleus sampling cutoff
    pub top_p: f64,
    /// Maximum tokens to generate
    pub max_tokens: u32,
}

impl From<&ExperimentConfig> for GenerationParams {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        }
    }
}

/// A transport that turns a prompt into raw model text
pub trait ModelBackend {
    /// Short identifier for logs
    fn name(&self) -> &str;

    /// Send one prompt, single attempt
    ///
    /// # Errors
    ///
    /// Returns a typed [`CallError`] describing why no text was produced.
    fn generate(&self, prompt: &str) -> Result<String, CallError>;
}

// ============================================================================
// HTTP backend
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: GenerateOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// Ollama `/api/generate` over HTTP
pub struct HttpBackend {
    endpoint: String,
    params: GenerationParams,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl HttpBackend {
    /// Create an HTTP backend
    ///
    /// # Errors
    ///
    /// Returns `CallError::Connection` if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        params: GenerationParams,
        timeout: Duration,
    ) -> Result<Self, CallError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::Connection(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            params,
            timeout,
            client,
        })
    }

    fn classify(&self, err: &reqwest::Error) -> CallError {
        if err.is_timeout() {
            CallError::Timeout(self.timeout)
        } else if err.is_connect() || err.is_request() {
            CallError::Connection(err.to_string())
        } else if let Some(status) = err.status() {
            CallError::Http {
                status: status.as_u16(),
            }
        } else {
            CallError::InvalidResponse(err.to_string())
        }
    }
}

impl ModelBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn generate(&self, prompt: &str) -> Result<String, CallError> {
        let request = GenerateRequest {
            model: &self.params.model,
            prompt,
            options: GenerateOptions {
                temperature: self.params.temperature,
                num_predict: self.params.max_tokens,
            },
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::Http {
                status: status.as_u16(),
            });
        }

        let body: GenerateResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout(self.timeout)
            } else {
                CallError::InvalidResponse(e.to_string())
            }
        })?;

        Ok(body.response.unwrap_or_default().trim().to_string())
    }
}

// ============================================================================
// CLI backend
// ============================================================================

/// `ollama run` (or a compatible command) as a subprocess
pub struct CliBackend {
    program: String,
    leading_args: Vec<String>,
    params: GenerationParams,
    timeout: Duration,
}

impl CliBackend {
    /// Create a CLI backend from a shell-style command line such as `ollama run`
    ///
    /// # Errors
    ///
    /// Returns `CallError::InvalidResponse` if the command line is empty or
    /// cannot be split.
    pub fn new(command: &str, params: GenerationParams, timeout: Duration) -> Result<Self, CallError> {
        let mut words = shell_words::split(command)
            .map_err(|e| CallError::InvalidResponse(format!("bad command line {command:?}: {e}")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| CallError::InvalidResponse("empty command line".to_string()))?;
        Ok(Self {
            program,
            leading_args: words.collect(),
            params,
            timeout,
        })
    }

    /// Full argument list for a prompt
    #[must_use]
    pub fn args(&self, prompt: &str) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            self.params.model.clone(),
            "--temperature".to_string(),
            self.params.temperature.to_string(),
            "--top-p".to_string(),
            self.params.top_p.to_string(),
            "--num-predict".to_string(),
            self.params.max_tokens.to_string(),
            prompt.to_string(),
        ]);
        args
    }

    /// Wait for the child, killing it once the timeout elapses
    fn wait_with_timeout(&self, child: &mut Child) -> Result<std::process::ExitStatus, CallError> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if start.elapsed() > self.timeout {
                child.kill().ok();
                child.wait().ok();
                return Err(CallError::Timeout(self.timeout));
            }
            std::thread::sleep(CHILD_POLL_INTERVAL);
        }
    }
}

/// Drain a pipe on a helper thread so the child never blocks on a full buffer
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf).ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl ModelBackend for CliBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn generate(&self, prompt: &str) -> Result<String, CallError> {
        let mut child = Command::new(&self.program)
            .args(self.args(prompt))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = self.wait_with_timeout(&mut child)?;

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            return Err(CallError::NonZeroExit {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(stdout.trim().to_string())
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Bounded retry for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first
    pub retries: u32,
    /// Sleep between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_secs(1),
        }
    }
}

impl From<&BackendConfig> for RetryPolicy {
    fn from(config: &BackendConfig) -> Self {
        Self {
            retries: config.retries,
            delay: config.retry_delay(),
        }
    }
}

/// A backend plus its retry policy
pub struct ModelCaller {
    backend: Box<dyn ModelBackend>,
    retry: RetryPolicy,
}

impl ModelCaller {
    /// Wrap a backend with a retry policy
    #[must_use]
    pub fn new(backend: Box<dyn ModelBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Build the backend selected by the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be constructed.
    pub fn from_config(config: &ExperimentConfig) -> Result<Self, CallError> {
        let params = GenerationParams::from(config);
        let timeout = config.backend.timeout();
        let backend: Box<dyn ModelBackend> = match config.backend.kind {
            BackendKind::Http => Box::new(HttpBackend::new(
                config.backend.endpoint.clone(),
                params,
                timeout,
            )?),
            BackendKind::Cli => Box::new(CliBackend::new(&config.backend.command, params, timeout)?),
        };
        Ok(Self::new(backend, RetryPolicy::from(&config.backend)))
    }

    /// Backend identifier
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Retry policy in effect
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Call the backend, retrying transient failures
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-transient error.
    pub fn call(&self, prompt: &str) -> Result<String, CallError> {
        let mut attempt = 0;
        loop {
            match self.backend.generate(prompt) {
                Ok(text) => return Ok(text),
                Err(err) if err.is_transient() && attempt < self.retry.retries => {
                    attempt += 1;
                    tracing::debug!(
                        backend = self.backend.name(),
                        attempt,
                        error = %err,
                        "Transient model call failure, retrying"
                    );
                    std::thread::sleep(self.retry.delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Call the backend; any failure degrades to an empty response
    #[must_use]
    pub fn call_or_empty(&self, prompt: &str) -> String {
        self.call(prompt).unwrap_or_else(|err| {
            tracing::warn!(backend = self.backend.name(), error = %err, "Model call failed");
            String::new()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::rc::Rc;

    /// Backend that replays a fixed script of outcomes
    struct ScriptedBackend {
        script: RefCell<VecDeque<Result<String, CallError>>>,
        calls: Rc<Cell<usize>>,
    }

    impl ModelBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, _prompt: &str) -> Result<String, CallError> {
            self.calls.set(self.calls.get() + 1);
            self.script
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    /// Caller over a scripted backend, plus a handle counting attempts
    fn scripted(
        script: Vec<Result<String, CallError>>,
        retries: u32,
    ) -> (ModelCaller, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let backend = ScriptedBackend {
            script: RefCell::new(script.into()),
            calls: Rc::clone(&calls),
        };
        let policy = RetryPolicy {
            retries,
            delay: Duration::ZERO,
        };
        (ModelCaller::new(Box::new(backend), policy), calls)
    }

    fn params() -> GenerationParams {
        GenerationParams {
            model: "phi3:mini".to_string(),
            temperature: 0.0,
            top_p: 0.95,
            max_tokens: 16,
        }
    }

    #[test]
    fn test_call_success_first_attempt() {
        let (caller, calls) = scripted(vec![Ok("a".to_string())], 1);
        assert_eq!(caller.call("prompt").unwrap(), "a");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_call_retries_timeout_once() {
        let (caller, calls) = scripted(
            vec![
                Err(CallError::Timeout(Duration::from_secs(30))),
                Ok("42".to_string()),
            ],
            1,
        );
        assert_eq!(caller.call("prompt").unwrap(), "42");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_call_gives_up_after_retries() {
        let (caller, calls) = scripted(
            vec![
                Err(CallError::Connection("refused".into())),
                Err(CallError::Connection("refused".into())),
                Ok("late".to_string()),
            ],
            1,
        );
        assert!(matches!(caller.call("prompt"), Err(CallError::Connection(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_call_retries_server_error() {
        let (caller, calls) = scripted(
            vec![Err(CallError::Http { status: 503 }), Ok("7".to_string())],
            1,
        );
        assert_eq!(caller.call("prompt").unwrap(), "7");
        assert_eq!(calls.get(), 2);

        let (caller, calls) = scripted(
            vec![Err(CallError::Http { status: 400 }), Ok("unused".to_string())],
            1,
        );
        assert!(matches!(
            caller.call("prompt"),
            Err(CallError::Http { status: 400 })
        ));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_call_does_not_retry_non_zero_exit() {
        let (caller, calls) = scripted(
            vec![
                Err(CallError::NonZeroExit {
                    code: Some(1),
                    stderr: "model not found".into(),
                }),
                Ok("unused".to_string()),
            ],
            3,
        );
        assert!(matches!(
            caller.call("prompt"),
            Err(CallError::NonZeroExit { .. })
        ));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_call_or_empty_degrades() {
        let (caller, calls) = scripted(
            vec![
                Err(CallError::Timeout(Duration::from_secs(1))),
                Err(CallError::Timeout(Duration::from_secs(1))),
            ],
            1,
        );
        assert_eq!(caller.call_or_empty("prompt"), "");
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_call_error_transience() {
        assert!(CallError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(CallError::Connection("x".into()).is_transient());
        assert!(CallError::Http { status: 500 }.is_transient());
        assert!(CallError::Http { status: 503 }.is_transient());
        assert!(!CallError::Http { status: 404 }.is_transient());
        assert!(!CallError::InvalidResponse("x".into()).is_transient());
        assert!(!CallError::NonZeroExit {
            code: None,
            stderr: String::new()
        }
        .is_transient());
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 1);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_cli_backend_args() {
        let backend = CliBackend::new("ollama run", params(), Duration::from_secs(5)).unwrap();
        assert_eq!(backend.name(), "ollama");
        assert_eq!(
            backend.args("What is 2 + 2?"),
            vec![
                "run",
                "phi3:mini",
                "--temperature",
                "0",
                "--top-p",
                "0.95",
                "--num-predict",
                "16",
                "What is 2 + 2?"
            ]
        );
    }

    #[test]
    fn test_cli_backend_empty_command() {
        assert!(CliBackend::new("   ", params(), Duration::from_secs(5)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_cli_backend_echo() {
        let backend = CliBackend::new("echo", params(), Duration::from_secs(5)).unwrap();
        let text = backend.generate("hello there").unwrap();
        assert!(text.starts_with("phi3:mini --temperature 0"));
        assert!(text.ends_with("hello there"));
    }

    #[cfg(unix)]
    #[test]
    fn test_cli_backend_non_zero_exit() {
        let backend = CliBackend::new("false", params(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            backend.generate("prompt"),
            Err(CallError::NonZeroExit { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_cli_backend_timeout() {
        let backend =
            CliBackend::new("sh -c \"exec sleep 5\"", params(), Duration::from_millis(100)).unwrap();
        assert!(matches!(
            backend.generate("prompt"),
            Err(CallError::Timeout(_))
        ));
    }

    #[test]
    fn test_cli_backend_missing_program() {
        let backend = CliBackend::new(
            "this-command-definitely-does-not-exist-12345",
            params(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(backend.generate("prompt"), Err(CallError::Spawn(_))));
    }

    /// One-shot HTTP server that answers a single request with `body`
    fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            let mut request_body = vec![0; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let mut stream = stream;
            write!(
                stream,
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            stream.flush().unwrap();
        });
        format!("http://{addr}/api/generate")
    }

    #[test]
    fn test_http_backend_success() {
        let endpoint = serve_once("HTTP/1.1 200 OK", r#"{"model":"phi3:mini","response":"  a \n","done":true}"#);
        let backend = HttpBackend::new(endpoint, params(), Duration::from_secs(5)).unwrap();
        assert_eq!(backend.generate("prompt").unwrap(), "a");
    }

    #[test]
    fn test_http_backend_missing_response_field() {
        let endpoint = serve_once("HTTP/1.1 200 OK", r#"{"done":true}"#);
        let backend = HttpBackend::new(endpoint, params(), Duration::from_secs(5)).unwrap();
        assert_eq!(backend.generate("prompt").unwrap(), "");
    }

    #[test]
    fn test_http_backend_server_error() {
        let endpoint = serve_once("HTTP/1.1 500 Internal Server Error", r#"{"error":"boom"}"#);
        let backend = HttpBackend::new(endpoint, params(), Duration::from_secs(5)).unwrap();
        assert!(matches!(
            backend.generate("prompt"),
            Err(CallError::Http { status: 500 })
        ));
    }

    #[test]
    fn test_http_backend_connection_refused() {
        // Bind then drop to get a port nothing listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let backend = HttpBackend::new(
            format!("http://127.0.0.1:{port}/api/generate"),
            params(),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = backend.generate("prompt").unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[test]
    fn test_from_config_selects_backend() {
        let mut config = ExperimentConfig::default();
        config.backend.kind = BackendKind::Cli;
        let caller = ModelCaller::from_config(&config).unwrap();
        assert_eq!(caller.backend_name(), "ollama");
        assert_eq!(caller.retry_policy(), RetryPolicy::default());

        config.backend.kind = BackendKind::Http;
        let caller = ModelCaller::from_config(&config).unwrap();
        assert_eq!(caller.backend_name(), "http");
    }
}
