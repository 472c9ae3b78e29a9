//! WebSocket support for real-time features
//!
//! - Operator presence (`online` / `busy` / `offline`), persisted to `users.status`
//! - Client chat rooms: new messages and ticket updates for a client
//! - Personal notifications pushed to every session of a user
//!
//! # Architecture
//!
//! - **Connection**: an authenticated WebSocket connection
//! - **Room**: followers of one client chat
//! - **State**: live sessions grouped by operator
//! - **Handler**: Axum route handler
//! - **Events**: type-safe client/server events

pub mod connection;
pub mod events;
pub mod handler;
pub mod room;
pub mod state;

pub use handler::ws_handler;
pub use state::WebSocketState;
