//! Pipe bridge between the dispatcher and the suggestion process.
//!
//! # Architecture
//!
//! - **protocol**: Message types (LookupRequest, LookupResponse)
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
