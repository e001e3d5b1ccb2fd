//! Wire bridge between proxies and adapters.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (ClientFrame from proxy side, ServerFrame from adapter side)
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
