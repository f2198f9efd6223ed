use crate::protocol::frame::{DEFAULT_MAX_FRAME_LEN, FrameError, read_frame, write_frame};
use crate::protocol::message::{Request, Response};
use bytes::Bytes;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed by daemon")]
    Closed,
}

/// Minimal IPC client: one request in flight at a time
pub struct RpcClient {
    stream: UnixStream,
    max_frame_len: u32,
    next_id: u64,
}

impl RpcClient {
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            stream,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            next_id: 1,
        })
    }

    /// Send a request and wait for its response
    pub async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Response, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request {
            id: Some(Value::from(id.to_string())),
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_vec(&request)?;
        write_frame(&mut self.stream, &payload).await?;
        self.read_response().await
    }

    /// Write an arbitrary payload as one frame
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        write_frame(&mut self.stream, payload).await?;
        Ok(())
    }

    /// Next raw frame; `None` once the daemon closes the connection
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, ClientError> {
        Ok(read_frame(&mut self.stream, self.max_frame_len).await?)
    }

    pub async fn read_response(&mut self) -> Result<Response, ClientError> {
        let frame = self.next_frame().await?.ok_or(ClientError::Closed)?;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Underlying stream, for callers that need to write raw bytes
    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }
}
