//! Network surfaces: the TCP ingestion listener and the HTTP query/stream
//! server with its auth middleware.

pub mod auth;
pub mod http;
pub mod tcp;
pub mod ws;
