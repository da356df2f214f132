//! Gateway Session
//!
//! Manages one external gateway process for a single bridged conversation.
//! Handles JSON-lines protocol communication over stdin/stdout.

use crate::config::BridgeConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Request sent to the gateway process
#[derive(Debug, Serialize)]
pub struct GatewayRequest {
    /// Type of request: `relay` or `latest_reply`
    #[serde(rename = "type")]
    pub request_type: String,
    /// Conversation the request belongs to
    pub conversation_id: String,
    /// Store id of the visitor message (for "relay" type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Visitor label (for "relay" type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Message content (for "relay" type)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl GatewayRequest {
    /// Forward a visitor message
    pub fn relay(conversation_id: &str, message_id: &str, sender: Option<&str>, content: &str) -> Self {
        Self {
            request_type: "relay".to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: Some(message_id.to_string()),
            sender: sender.map(String::from),
            content: Some(content.to_string()),
        }
    }

    /// Ask for the newest operator reply
    pub fn latest_reply(conversation_id: &str) -> Self {
        Self {
            request_type: "latest_reply".to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: None,
            sender: None,
            content: None,
        }
    }
}

/// Response received from the gateway process
#[derive(Debug, Deserialize)]
pub struct GatewayResponse {
    /// Status of the response
    pub status: String,
    /// Response data (for success)
    pub data: Option<Value>,
    /// Error message (for error)
    pub message: Option<String>,
}

/// Operator reply as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayReply {
    /// Gateway-assigned id; stable across repeated fetches
    pub id: String,
    /// Reply text
    pub body: String,
    /// Unix milliseconds; the relay stamps the fetch time when absent
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Handle to an external gateway subprocess
///
/// The gateway owns the operator-side channel (an email inbox, a chat
/// workspace, ...). This side only forwards visitor messages and asks for
/// the latest reply.
pub struct GatewaySession {
    /// Child process handle (without stdin/stdout/stderr)
    child: Mutex<Option<Child>>,
    /// Stdin handle for sending requests
    stdin: Mutex<Option<ChildStdin>>,
    /// Stdout handle for receiving responses
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    /// Collected stderr, reported when the process dies
    stderr: Mutex<Option<tokio::task::JoinHandle<String>>>,
    /// Set while a request is written but its response not yet read
    ///
    /// Stays set if an exchange times out or is dropped midway; the next
    /// line on stdout would then answer the wrong request.
    out_of_sync: AtomicBool,
    /// Upper bound for one request/response exchange
    timeout: Duration,
    /// Conversation ID this session belongs to
    conversation_id: String,
}

impl GatewaySession {
    /// Spawn a gateway process for a conversation
    ///
    /// # Arguments
    /// * `conversation_id` - ID of the bridged conversation
    /// * `config` - Gateway command line
    /// * `timeout` - Bound for each exchange with the process
    pub async fn new(
        conversation_id: String,
        config: &BridgeConfig,
        timeout: Duration,
    ) -> Result<Self, String> {
        debug!(
            conversation_id = %conversation_id,
            command = %config.gateway_command,
            "Creating new gateway session"
        );

        let mut child = Command::new(&config.gateway_command)
            .args(&config.gateway_args)
            .env("CONVERSATION_ID", &conversation_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn gateway process: {}", e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "Failed to get stdin handle".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Failed to get stdout handle".to_string())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "Failed to get stderr handle".to_string())?;

        info!(
            conversation_id = %conversation_id,
            pid = child.id(),
            "Gateway process spawned"
        );

        let conversation_id_for_stderr = conversation_id.clone();
        let stderr_handle = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut stderr_buf = Vec::new();
            let mut stderr_reader = stderr;
            let _ = stderr_reader.read_to_end(&mut stderr_buf).await;
            let stderr_text = String::from_utf8_lossy(&stderr_buf).to_string();
            if !stderr_text.trim().is_empty() {
                debug!(
                    conversation_id = %conversation_id_for_stderr,
                    stderr = %stderr_text,
                    "Gateway process stderr output"
                );
            }
            stderr_text
        });

        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(BufReader::new(stdout))),
            stderr: Mutex::new(Some(stderr_handle)),
            out_of_sync: AtomicBool::new(false),
            timeout,
            conversation_id,
        })
    }

    /// Forward a visitor message; `Ok` means the gateway queued it
    pub async fn relay(
        &self,
        message_id: &str,
        sender: Option<&str>,
        content: &str,
    ) -> Result<(), String> {
        debug!(
            conversation_id = %self.conversation_id,
            message_id = %message_id,
            content_len = content.len(),
            "Relaying message to gateway"
        );
        let request = GatewayRequest::relay(&self.conversation_id, message_id, sender, content);
        self.exchange(&request).await.map(|_| ())
    }

    /// Ask the gateway for the newest operator reply, if any
    pub async fn latest_reply(&self) -> Result<Option<GatewayReply>, String> {
        let request = GatewayRequest::latest_reply(&self.conversation_id);
        match self.exchange(&request).await? {
            None | Some(Value::Null) => Ok(None),
            Some(data) => serde_json::from_value(data)
                .map(Some)
                .map_err(|e| format!("Failed to parse reply: {}", e)),
        }
    }

    /// Write one request line and read one response line
    async fn exchange(&self, request: &GatewayRequest) -> Result<Option<Value>, String> {
        let request_json = serde_json::to_string(request)
            .map_err(|e| format!("Failed to serialize request: {}", e))?;

        // Hold stdout across the write so concurrent exchanges cannot swap answers
        let mut stdout_guard = self.stdout.lock().await;
        if self.out_of_sync.swap(true, Ordering::SeqCst) {
            return Err("Gateway session lost track of a previous response".to_string());
        }

        {
            let mut stdin_guard = self.stdin.lock().await;
            let stdin = stdin_guard
                .as_mut()
                .ok_or_else(|| "Stdin handle not available".to_string())?;

            stdin
                .write_all(request_json.as_bytes())
                .await
                .map_err(|e| format!("Failed to write to stdin: {}", e))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| format!("Failed to write newline: {}", e))?;
            stdin
                .flush()
                .await
                .map_err(|e| format!("Failed to flush stdin: {}", e))?;
        }

        let response_line = tokio::time::timeout(self.timeout, async {
            if let Some(exit) = self.exit_report().await {
                return Err(exit);
            }

            let stdout_reader = stdout_guard
                .as_mut()
                .ok_or_else(|| "Stdout handle not available".to_string())?;

            let mut response_buffer = String::new();
            let bytes_read = stdout_reader
                .read_line(&mut response_buffer)
                .await
                .map_err(|e| format!("Failed to read response: {}", e))?;

            if bytes_read == 0 {
                return Err(self.exit_report().await.unwrap_or_else(|| {
                    "EOF while reading response (process may have exited)".to_string()
                }));
            }

            Ok::<String, String>(response_buffer.trim().to_string())
        })
        .await;

        let response_line = match response_line {
            Ok(Ok(line)) => {
                self.out_of_sync.store(false, Ordering::SeqCst);
                line
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    request = %request.request_type,
                    "Gateway timed out, abandoning process"
                );
                if let Some(child) = self.child.lock().await.as_mut() {
                    let _ = child.start_kill();
                }
                return Err(format!("Gateway did not answer within {:?}", self.timeout));
            }
        };

        let response: GatewayResponse = serde_json::from_str(&response_line)
            .map_err(|e| format!("Failed to parse response: {}", e))?;

        match response.status.as_str() {
            "success" => Ok(response.data),
            "error" => {
                let error_msg = response
                    .message
                    .unwrap_or_else(|| "Unknown error".to_string());
                error!(
                    conversation_id = %self.conversation_id,
                    request = %request.request_type,
                    error = %error_msg,
                    "Gateway returned error"
                );
                Err(error_msg)
            }
            _ => Err(format!("Unexpected response status: {}", response.status)),
        }
    }

    /// Describe the exit if the process is gone
    async fn exit_report(&self) -> Option<String> {
        let status = {
            let mut child_guard = self.child.lock().await;
            match child_guard.as_mut().map(Child::try_wait) {
                Some(Ok(Some(status))) => status,
                _ => return None,
            }
        };

        let stderr_handle = self.stderr.lock().await.take();
        let stderr_output = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        error!(
            conversation_id = %self.conversation_id,
            stderr = %stderr_output,
            exit_status = ?status,
            "Gateway process exited unexpectedly"
        );
        if stderr_output.trim().is_empty() {
            Some(format!("Gateway process exited with status {:?}", status))
        } else {
            Some(format!(
                "Gateway process exited with status {:?}. Stderr: {}",
                status,
                stderr_output.trim()
            ))
        }
    }

    /// Kill the gateway process
    pub async fn kill(&self) -> Result<(), String> {
        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            child
                .kill()
                .await
                .map_err(|e| format!("Failed to kill gateway process: {}", e))?;
            let _ = child.wait().await;

            info!(
                conversation_id = %self.conversation_id,
                "Gateway process killed"
            );
        }
        Ok(())
    }

    /// Check if the gateway process is still running and usable
    pub async fn is_running(&self) -> bool {
        if self.out_of_sync.load(Ordering::SeqCst) && self.stdout.try_lock().is_ok() {
            return false;
        }
        let mut child_guard = self.child.lock().await;
        match child_guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        if let Ok(mut child_guard) = self.child.try_lock() {
            if let Some(mut child) = child_guard.take() {
                let _ = child.start_kill();
            }
        }
    }
}
