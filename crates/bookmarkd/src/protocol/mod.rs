//! Local IPC protocol: length-prefixed JSON frames over a Unix socket

pub mod client;
pub mod frame;
pub mod message;
pub mod server;

pub use client::{ClientError, RpcClient};
pub use frame::{DEFAULT_MAX_FRAME_LEN, FrameError, read_frame, write_frame};
pub use message::{ErrorCode, Request, Response, RpcError, new_trace_id};
pub use server::{EventSource, Handler, RpcServer, ServerError, StreamHandler};
