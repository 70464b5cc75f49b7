use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::error::WorkcellError;
use super::types::{RpcRequest, decode_envelope, decode_tool_result};

pub const DEFAULT_WORKCELL_URL: &str = "http://192.168.68.55:8080";

const MCP_PATH: &str = "/mcp";
const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION: &str = "2024-11-05";
const ACCEPT: &str = "application/json, text/event-stream";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for a single backoff delay between read retries.
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Opaque session token issued by the workcell during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Retry behavior for idempotent reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1), capped at [`MAX_RETRY_DELAY_MS`].
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        2u64.checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.base_delay_ms.checked_mul(factor))
            .map_or(MAX_RETRY_DELAY_MS, |delay| delay.min(MAX_RETRY_DELAY_MS))
    }
}

/// Anything that can call a named tool on the workcell.
///
/// Submissions go through [`invoke`](ToolInvoker::invoke), which is never
/// retried. Reads may use [`invoke_read`](ToolInvoker::invoke_read), which
/// implementations are free to retry on transport errors.
#[allow(async_fn_in_trait)]
pub trait ToolInvoker {
    async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, WorkcellError>;

    async fn invoke_read(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, WorkcellError> {
        self.invoke(tool, arguments, timeout).await
    }
}

/// JSON-RPC client for the workcell's tool endpoint.
///
/// The session is opened lazily on the first call and reopened when the
/// workcell reports it no longer knows the token.
pub struct WorkcellClient {
    base_url: String,
    endpoint: String,
    client: Client,
    session: Mutex<Option<SessionHandle>>,
    next_id: AtomicU64,
    read_retry: RetryConfig,
}

impl WorkcellClient {
    pub fn new(base_url: &str) -> Result<Self, WorkcellError> {
        Self::with_retry(base_url, RetryConfig::default())
    }

    pub fn with_retry(base_url: &str, read_retry: RetryConfig) -> Result<Self, WorkcellError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WorkcellError::Connection {
                operation: "build http client".into(),
                message: e.to_string(),
            })?;
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            endpoint: format!("{base_url}{MCP_PATH}"),
            base_url,
            client,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
            read_retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Shared HTTP client, for REST endpoints next to the tool endpoint.
    pub fn http(&self) -> &Client {
        &self.client
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn current_session(&self) -> Option<SessionHandle> {
        self.session.lock().ok().and_then(|guard| guard.clone())
    }

    fn store_session(&self, handle: Option<SessionHandle>) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = handle;
        }
    }

    /// Performs the initialize handshake and stores the issued session token.
    pub async fn open_session(&self) -> Result<SessionHandle, WorkcellError> {
        let operation = "initialize";
        let request = RpcRequest::call(
            self.next_id(),
            operation,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
            }),
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("accept", ACCEPT)
            .json(&request)
            .timeout(HANDSHAKE_TIMEOUT)
            .send()
            .await
            .map_err(|e| WorkcellError::from_transport(operation, HANDSHAKE_TIMEOUT, e))?;

        let status = response.status();
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| WorkcellError::from_transport(operation, HANDSHAKE_TIMEOUT, e))?;

        if !status.is_success() {
            return Err(WorkcellError::Status {
                operation: operation.into(),
                status: status.as_u16(),
                body,
            });
        }

        let envelope = decode_envelope(operation, &body)?;
        if let Some(error) = envelope.error {
            return Err(WorkcellError::Remote {
                operation: operation.into(),
                message: error.message,
                payload: body,
            });
        }

        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
            return Err(WorkcellError::protocol(
                operation,
                "server did not return a session id",
                body,
            ));
        };
        let handle = SessionHandle(session_id);

        self.notify_initialized(&handle).await?;
        self.store_session(Some(handle.clone()));
        info!(endpoint = %self.endpoint, "workcell session opened");
        Ok(handle)
    }

    async fn notify_initialized(&self, session: &SessionHandle) -> Result<(), WorkcellError> {
        let operation = "notifications/initialized";
        let response = self
            .client
            .post(&self.endpoint)
            .header(SESSION_HEADER, session.as_str())
            .json(&RpcRequest::notification(operation))
            .timeout(HANDSHAKE_TIMEOUT)
            .send()
            .await
            .map_err(|e| WorkcellError::from_transport(operation, HANDSHAKE_TIMEOUT, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkcellError::Status {
                operation: operation.into(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn session(&self) -> Result<SessionHandle, WorkcellError> {
        match self.current_session() {
            Some(handle) => Ok(handle),
            None => self.open_session().await,
        }
    }

    async fn post_tool_call(
        &self,
        session: &SessionHandle,
        tool: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<(StatusCode, String), WorkcellError> {
        let id = self.next_id();
        let request = RpcRequest::call(
            id,
            "tools/call",
            json!({"name": tool, "arguments": arguments}),
        );
        debug!(tool, id, "calling workcell tool");

        let response = self
            .client
            .post(&self.endpoint)
            .header("accept", ACCEPT)
            .header(SESSION_HEADER, session.as_str())
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| WorkcellError::from_transport(tool, timeout, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| WorkcellError::from_transport(tool, timeout, e))?;
        Ok((status, body))
    }
}

/// The workcell answers 404, or 400 mentioning the session, when it has
/// dropped our token.
fn is_missing_session(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND
        || (status == StatusCode::BAD_REQUEST && body.to_ascii_lowercase().contains("session"))
}

impl ToolInvoker for WorkcellClient {
    async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, WorkcellError> {
        let session = self.session().await?;
        let (mut status, mut body) = self.post_tool_call(&session, tool, &arguments, timeout).await?;

        if is_missing_session(status, &body) {
            warn!(tool, "workcell dropped the session, re-handshaking");
            self.store_session(None);
            let session = self.open_session().await?;
            (status, body) = self.post_tool_call(&session, tool, &arguments, timeout).await?;
        }

        if !status.is_success() {
            return Err(WorkcellError::Status {
                operation: tool.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        decode_tool_result(tool, &body)
    }

    async fn invoke_read(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, WorkcellError> {
        let mut attempt = 0;
        loop {
            match self.invoke(tool, arguments.clone(), timeout).await {
                Err(err) if err.is_transport() && attempt < self.read_retry.max_retries => {
                    attempt += 1;
                    let delay_ms = self.read_retry.delay_for_attempt(attempt);
                    warn!(
                        tool,
                        attempt,
                        max = self.read_retry.max_retries,
                        delay_ms,
                        error = %err,
                        "transient workcell error, retrying read"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                result => return result,
            }
        }
    }
}
