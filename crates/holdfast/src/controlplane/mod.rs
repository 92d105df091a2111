//! The daemon's control plane: an HTTP listener exposing `/status`,
//! `/health`, `/ready`, `/trigger`, `/metrics`, and per-forge
//! `/webhook/<forge>` routes, plus an optional Unix-socket RPC listener
//! for local CLI tooling.

pub mod http;
pub mod rpc;
pub mod signature;

pub use http::serve;
