//! Embeds an HTTP endpoint (spec.md §4.8) over a running [`SnapshotRing`],
//! rendering the newest and an N-samples-back snapshot as Prometheus text
//! or JSON depending on content negotiation.

pub mod error;
pub mod negotiate;
pub mod render;
pub mod routes;
pub mod server;
pub mod service;

pub use error::{Result, ServerError};
pub use server::serve;
pub use service::AppState;
