//! WebSocket room transport for the voxroom session controller.
//!
//! A session is one authenticated WebSocket carrying JSON frames: local audio
//! and chat go up, participant updates, agent audio and chat come down.

pub mod audio;
pub mod protocol;
pub mod session;

pub use session::{WsTransport, WsTransportSession};
