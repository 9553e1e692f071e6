//! Application layer - Public facade and extension points.
//!
//! - `client`: the [`ApiClient`](client::ApiClient) facade the owning
//!   application talks to
//! - `middleware`: ordered hook chain invoked around send/receive/dispatch

pub mod client;
pub mod middleware;
