use crate::protocol::frame::{DEFAULT_MAX_FRAME_LEN, FrameError, read_frame, write_frame};
use crate::protocol::message::{Request, Response, RpcError, new_trace_id};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Unary method handler
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: Option<Value>) -> Result<Value, RpcError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn call(&self, params: Option<Value>) -> Result<Value, RpcError> {
        (self)(params).await
    }
}

/// Source of pre-serialized messages for a streaming method
#[async_trait]
pub trait EventSource: Send {
    /// Next message; `None` when the source has closed
    async fn next_event(&mut self) -> Option<Bytes>;
}

#[async_trait]
impl EventSource for mpsc::Receiver<Bytes> {
    async fn next_event(&mut self) -> Option<Bytes> {
        self.recv().await
    }
}

/// Streaming method handler: opens a source that is forwarded frame by frame
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn open(&self, params: Option<Value>) -> Result<Box<dyn EventSource>, RpcError>;
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Box<dyn EventSource>, RpcError>> + Send + 'static,
{
    async fn open(&self, params: Option<Value>) -> Result<Box<dyn EventSource>, RpcError> {
        (self)(params).await
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server already started")]
    AlreadyStarted,
}

#[derive(Default)]
struct Registry {
    unary: HashMap<String, Arc<dyn Handler>>,
    streams: HashMap<String, Arc<dyn StreamHandler>>,
}

enum Route {
    Unary(Arc<dyn Handler>),
    Stream(Arc<dyn StreamHandler>),
}

impl Registry {
    /// Unary handlers shadow streaming ones of the same name
    fn route(&self, method: &str) -> Option<Route> {
        if let Some(h) = self.unary.get(method) {
            return Some(Route::Unary(Arc::clone(h)));
        }
        self.streams
            .get(method)
            .map(|h| Route::Stream(Arc::clone(h)))
    }
}

type SharedRegistry = Arc<RwLock<Registry>>;

/// IPC server over a Unix domain socket
///
/// One task per connection; requests on a connection are handled strictly in
/// order. A streaming method takes over its connection until the source
/// closes, the peer disconnects, or the server stops.
pub struct RpcServer {
    registry: SharedRegistry,
    max_frame_len: u32,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    socket_path: Option<PathBuf>,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl RpcServer {
    pub fn new(max_frame_len: u32) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            max_frame_len,
            shutdown,
            accept_task: None,
            socket_path: None,
        }
    }

    pub fn register<H: Handler + 'static>(&self, method: &str, handler: H) {
        let mut registry = self.registry.write().unwrap_or_else(|p| p.into_inner());
        registry.unary.insert(method.to_string(), Arc::new(handler));
    }

    pub fn register_stream<H: StreamHandler + 'static>(&self, method: &str, handler: H) {
        let mut registry = self.registry.write().unwrap_or_else(|p| p.into_inner());
        registry.streams.insert(method.to_string(), Arc::new(handler));
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Bind the socket and start accepting connections in the background
    pub async fn start<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ServerError> {
        if self.accept_task.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let path = path.as_ref().to_path_buf();
        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path)?;
        restrict_permissions(&path)?;
        info!("IPC server listening on {:?}", path);

        self.shutdown.send_replace(false);
        let registry = Arc::clone(&self.registry);
        let max_frame_len = self.max_frame_len;
        let shutdown = self.shutdown.subscribe();
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            registry,
            max_frame_len,
            shutdown,
        )));
        self.socket_path = Some(path);
        Ok(())
    }

    /// Stop accepting, signal open connections, and remove the socket file
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("accept loop ended abnormally: {}", e);
            }
        }
        if let Some(path) = self.socket_path.take() {
            if let Err(e) = remove_stale_socket(&path) {
                warn!("failed to remove socket {:?}: {}", path, e);
            }
        }
        info!("IPC server stopped");
    }
}

fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

async fn accept_loop(
    listener: UnixListener,
    registry: SharedRegistry,
    max_frame_len: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("accept loop shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => {
                    debug!("New connection");
                    let registry = Arc::clone(&registry);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, registry, max_frame_len, shutdown).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    socket: UnixStream,
    registry: SharedRegistry,
    max_frame_len: u32,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), FrameError> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = read_frame(&mut reader, max_frame_len) => frame,
        };

        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("Connection closed");
                return Ok(());
            }
            Err(FrameError::TooLarge { len, max }) => {
                // The body was never read, so the stream cannot be resynced
                warn!(len, max, "rejecting oversized frame");
                let err = RpcError::invalid_request("frame too large")
                    .with_detail("frameBytes", len)
                    .with_detail("maxFrameBytes", max);
                send(&mut writer, Response::failure(None, new_trace_id(), err)).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let trace_id = new_trace_id();
        let request: Request = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(trace_id = %trace_id, "invalid request frame: {}", e);
                // Keep the caller's id when the frame is JSON but not a request
                let id = serde_json::from_slice::<Value>(&payload)
                    .ok()
                    .and_then(|mut v| v.get_mut("id").map(Value::take))
                    .filter(|id| !id.is_null());
                let message = if e.is_data() { "invalid request" } else { "invalid json" };
                let err = RpcError::invalid_request(message).with_detail("cause", e.to_string());
                send(&mut writer, Response::failure(id, trace_id, err)).await?;
                continue;
            }
        };

        let route = registry
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .route(&request.method);

        match route {
            Some(Route::Unary(handler)) => {
                let response = match handler.call(request.params).await {
                    Ok(result) => Response::success(request.id, trace_id.clone(), result),
                    Err(err) => Response::failure(request.id, trace_id.clone(), err),
                };
                debug!(trace_id = %trace_id, method = %request.method, ok = response.ok, "handled request");
                send(&mut writer, response).await?;
            }
            Some(Route::Stream(handler)) => match handler.open(request.params).await {
                Ok(source) => {
                    debug!(trace_id = %trace_id, method = %request.method, "stream opened");
                    let ack = Response::success(request.id, trace_id, json!({"subscribed": true}));
                    send(&mut writer, ack).await?;
                    return stream_events(source, reader, writer, shutdown).await;
                }
                Err(err) => {
                    send(&mut writer, Response::failure(request.id, trace_id, err)).await?;
                }
            },
            None => {
                debug!(trace_id = %trace_id, method = %request.method, "unknown method");
                let err = RpcError::invalid_request("unknown method")
                    .with_detail("method", request.method.clone());
                send(&mut writer, Response::failure(request.id, trace_id, err)).await?;
            }
        }
    }
}

/// Forward every message from `source` as its own frame
async fn stream_events(
    mut source: Box<dyn EventSource>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), FrameError> {
    let mut scratch = [0u8; 256];
    loop {
        tokio::select! {
            event = source.next_event() => match event {
                Some(payload) => write_frame(&mut writer, &payload).await?,
                None => {
                    debug!("stream source closed");
                    return Ok(());
                }
            },
            // Only used to notice the peer going away; input is ignored while streaming
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => {
                    debug!("stream peer disconnected");
                    return Ok(());
                }
                Ok(_) => {}
            },
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, response: Response) -> Result<(), FrameError> {
    let payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            let fallback = Response::failure(
                response.id,
                response.trace_id,
                RpcError::internal(format!("response serialization failed: {e}")),
            );
            serde_json::to_vec(&fallback).map_err(std::io::Error::from)?
        }
    };
    write_frame(writer, &payload).await
}
