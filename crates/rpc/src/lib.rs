//! Synchronous RPC over H3 streams, plus the tool registry consumed by
//! pipeline orchestrations.
//!
//! An RPC is a POST to `/<service>/<method>` with a BinCodec-encoded body
//! and `content-type: application/vnd.binary-rpc`. The client blocks inside
//! the call, looping the session's `poll` with a deadline; a timeout cancels
//! the underlying stream in both directions and leaves the session usable
//! for the next request.

pub mod client;
pub mod registry;

pub use client::{
    download_stream, request, upload_stream, DownloadSummary, RpcError, RpcOptions, UploadStream,
    CONTENT_TYPE_BINARY_RPC, CONTENT_TYPE_LEGACY, DEFAULT_TIMEOUT,
};
pub use registry::{McpTarget, RagBinding, ToolHandler, ToolRegistry, ToolRegistryError};
