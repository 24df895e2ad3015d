//! Client side of the daemon socket
//!
//! One request per connection, framed as a little-endian `u32` length and a
//! bincode body.

use crate::{Request, Response};
use serde::{de::DeserializeOwned, Serialize};

use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Operation timeout after {0}ms")]
    OperationTimeout(u64),

    #[error("Daemon not running at {0}")]
    DaemonNotRunning(String),

    #[error("Message too large: {0} bytes exceeds maximum of {1} bytes")]
    MessageTooLarge(usize, usize),
}

pub const DEFAULT_SOCKET_PATH: &str = "/run/avroomd/avroomd.sock";
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// Same cap the daemon enforces on requests
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: String,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcClient {
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }

    pub fn with_socket_path<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_string_lossy().to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    /// Applies to connecting, and separately to each direction of the exchange
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    pub fn with_retry_params(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = Duration::from_millis(retry_delay_ms);
        self
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    pub async fn is_daemon_running(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    pub async fn connect(&self) -> Result<UnixStream, IpcError> {
        for attempt in 0..=self.max_retries {
            match timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) if attempt < self.max_retries => {
                    tracing::warn!("Connect to {} failed ({}), attempt {}", self.socket_path, e, attempt + 1);
                    sleep(self.retry_delay).await;
                }
                Ok(Err(_)) => break,
                Err(_) => return Err(IpcError::ConnectionTimeout),
            }
        }
        Err(IpcError::DaemonNotRunning(self.socket_path.clone()))
    }

    /// Send `request` and wait for the daemon's answer.
    ///
    /// A failed exchange is retried on a fresh connection. Connection
    /// failures are retried inside [`IpcClient::connect`] and returned as is.
    pub async fn send(&self, request: &Request) -> Result<Response, IpcError> {
        let payload = encode(request)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
        }

        let mut attempt = 0;
        loop {
            let mut stream = self.connect().await?;
            match self.exchange(&mut stream, &payload).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.max_retries => {
                    tracing::warn!("Request failed ({}), attempt {}", e, attempt + 1);
                    sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exchange(&self, stream: &mut UnixStream, payload: &[u8]) -> Result<Response, IpcError> {
        let elapsed = || IpcError::OperationTimeout(self.timeout.as_millis() as u64);

        timeout(self.timeout, write_frame(stream, payload))
            .await
            .map_err(|_| elapsed())??;

        let body = timeout(self.timeout, read_frame(stream))
            .await
            .map_err(|_| elapsed())??;
        decode(&body)
    }
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<(), IpcError> {
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>, IpcError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// One-shot request with default timeouts and retries
pub async fn send_to_path<P: AsRef<Path>>(request: &Request, socket_path: P) -> Result<Response, IpcError> {
    IpcClient::with_socket_path(socket_path).send(request).await
}

/// `None` checks [`DEFAULT_SOCKET_PATH`]
pub async fn is_daemon_running<P: AsRef<Path>>(socket_path: Option<P>) -> bool {
    match socket_path {
        Some(path) => UnixStream::connect(path.as_ref()).await.is_ok(),
        None => UnixStream::connect(DEFAULT_SOCKET_PATH).await.is_ok(),
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    bincode::serialize(msg).map_err(|e| IpcError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    bincode::deserialize(bytes).map_err(|e| IpcError::Serialization(e.to_string()))
}
