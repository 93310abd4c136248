//! Yamux-style stream multiplexing over one secured duplex connection
//!
//! This crate turns a single ordered, reliable byte connection (already
//! encrypted by the layer below) into many independent logical streams.
//! It allows applications to:
//!
//! - Open multiple concurrent streams per connection, with optimistic open
//! - Use standard Rust async I/O traits (AsyncRead, AsyncWrite)
//! - Rely on per-stream credit flow control so one slow reader never
//!   stalls the other streams
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓
//! Stream (state machine + flow control)
//!     ↓
//! Session (one reader task, one writer task)
//!     ↓
//! secured duplex connection (AsyncRead + AsyncWrite)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use p2p_mux::{MuxerAdaptor, Role, Yamux};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = TcpStream::connect("127.0.0.1:4000").await?;
//!     let session = Yamux::default().mux_connection(conn, Role::Initiator)?;
//!
//!     let stream = session.open_stream()?;
//!     stream.write(b"hello").await?;
//!
//!     let mut buf = vec![0u8; 1024];
//!     let n = stream.read(&mut buf).await?;
//!     stream.close()?;
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod flow;
pub mod muxer;
pub mod protocol;
pub mod session;
pub mod stream;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use flow::FlowController;
pub use muxer::{MuxerAdaptor, Yamux, PROTOCOL_ID};
pub use protocol::{Flags, Frame, FrameCodec, FrameType, Header, DEFAULT_WINDOW_SIZE, HEADER_SIZE};
pub use session::{Role, Session, SessionState};
pub use stream::{Stream, StreamState};
