//! Request-collapsing HTTP proxy.
//!
//! When several callers concurrently issue requests that resolve to the same
//! upstream resource, [`CollapseProxy`] performs exactly one upstream fetch
//! and fans the streamed response body out to every waiting caller. Bodies
//! stay streaming end to end: each follower reads from its own pipe fed by
//! the leader's [`MultiTee`] body, and the slowest follower paces the group
//! instead of anything being buffered in full.
//!
//! Callers may still join an in-flight request after the response head has
//! arrived, up to the moment the first body byte is read. Past that cutoff
//! the sealed group is moved aside and the late caller starts a fresh fetch.

mod body;
mod message;
/// The collapse registry and its entry point.
pub mod proxy;
mod tee;
/// The upstream client boundary.
pub mod upstream;

pub use body::Body;
pub use message::{Request, Response};
pub use proxy::{CollapseError, CollapseOpts, CollapseProxy, KeyFn};
pub use tee::{MultiTee, TeeError};
pub use upstream::{ReqwestClient, Upstream};

/// Default back-pressure window between the tee and each follower.
pub(crate) const DEFAULT_PIPE_CAPACITY: usize = 8 * 1024;
