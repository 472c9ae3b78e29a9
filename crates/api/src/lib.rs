//! LineDesk API Library
//!
//! HTTP API, channel integrations and business services of the LineDesk
//! contact-center backend. The worker links against this crate for the
//! scheduled jobs.

pub mod ai_agent;
pub mod auth;
pub mod channels;
pub mod config;
pub mod email;
pub mod error;
pub mod pbx;
pub mod routes;
pub mod security;
pub mod services;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
