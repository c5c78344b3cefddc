//! Realtime Voice Session Manager
//!
//! This library maintains a persistent bidirectional audio+event connection
//! to a realtime speech service: it streams microphone PCM16 audio out,
//! plays assistant audio back, enforces echo-avoidance and turn-taking
//! policy, and reconnects automatically until stopped. The embedding
//! application controls it through the thread-safe [`RealtimeClient`] facade
//! and observes it through a [`ClientNotification`] channel.

pub mod audio;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod notify;
pub mod protocol;
mod session;
mod state;
mod supervisor;
pub mod transport;

pub use client::RealtimeClient;
pub use config::{ClientConfig, ConfigError, SessionConfig};
pub use error::{Error, Result};
pub use notify::ClientNotification;
