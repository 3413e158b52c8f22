//! aibridge Library
//!
//! JSON-RPC 2.0 bridge between tool-calling clients and a conversational AI
//! backend. Provides:
//! - Pipe (stdin/stdout), SSE, and chunked HTTP streaming transports
//! - A session registry with idle-TTL expiry
//! - In-flight request tracking with cancellation and deadlines
//! - Bounded per-session conversation history

pub mod ai;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod logging;
pub mod protocol;
pub mod requests;
pub mod server;
pub mod session;
pub mod transport;

pub use config::BridgeConfig;
pub use engine::{EngineConfig, ProtocolEngine};
pub use error::{BridgeError, Result};
pub use history::ConversationHistory;
pub use requests::RequestTracker;
pub use session::SessionRegistry;
