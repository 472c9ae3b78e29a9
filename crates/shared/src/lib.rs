//! LineDesk Shared Types and Utilities
//!
//! Domain enums, business rules, database and rate-limit helpers shared by the
//! API server and the background worker.

pub mod db;
pub mod error;
pub mod rate_limit;
pub mod types;
pub mod workflow;

pub use db::*;
pub use error::*;
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimitResult, RateLimiter};
pub use types::*;
