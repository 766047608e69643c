pub mod capture;
pub mod chat;
pub mod controller;
pub mod credential;
pub mod error;
pub mod level;
pub mod monitor;
pub mod transport;
pub mod types;

pub use capture::{CaptureUnit, Microphone, MicrophoneStream};
pub use controller::{ControllerConfig, SessionController};
pub use credential::{CredentialFetcher, HttpCredentialFetcher};
pub use error::{ErrorKind, SessionError};
pub use transport::{Transport, TransportEvent, TransportLink, TransportSession};
pub use types::{
    AudioFrame, ChatMessage, ChatRecord, ChatSender, ConnectionStatus, SessionCredential,
    SessionSnapshot,
};

/// Commands the presentation layer issues to a `SessionController`.
///
/// Front ends map their own input (buttons, key presses, console lines) onto
/// this enum and hand it to `dispatch`, keeping input handling decoupled from
/// the controller's command surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect,
    Disconnect,
    ToggleSpeaking,
    SetVolume(f32),
    SendChat(String),
}

impl SessionController {
    pub fn dispatch(&self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::ToggleSpeaking => self.toggle_speaking(),
            Command::SetVolume(percent) => self.set_volume(percent),
            Command::SendChat(text) => self.send_chat_message(text),
        }
    }
}
