//! Line-oriented presentation of a session.
//!
//! Parses console input into controller commands and renders the differences
//! between two snapshots as printable lines.

use voxroom_core::{
    Command,
    types::{ChatSender, ConnectionStatus, SessionSnapshot},
};

pub const HELP: &str = "\
Commands:
  /connect        join the room
  /disconnect     leave the room
  /mic            toggle the microphone
  /volume <0-100> set playback volume
  /status         show the current session state
  /quit           leave and exit
Anything else is sent as a chat message.";

const METER_WIDTH: usize = 20;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Command(Command),
    Status,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_line(line: &str) -> ConsoleInput {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleInput::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ConsoleInput::Command(Command::SendChat(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let argument = parts.next();
    match name.as_str() {
        "connect" => ConsoleInput::Command(Command::Connect),
        "disconnect" => ConsoleInput::Command(Command::Disconnect),
        "mic" => ConsoleInput::Command(Command::ToggleSpeaking),
        "volume" => match argument.map(str::parse::<f32>) {
            Some(Ok(percent)) if percent.is_finite() => {
                ConsoleInput::Command(Command::SetVolume(percent))
            }
            _ => ConsoleInput::Invalid("usage: /volume <0-100>".to_string()),
        },
        "status" => ConsoleInput::Status,
        "help" => ConsoleInput::Help,
        "quit" | "exit" => ConsoleInput::Quit,
        _ => ConsoleInput::Invalid(format!("unknown command: /{}", name)),
    }
}

/// Lines describing what changed between two published states.
pub fn describe_change(previous: &SessionSnapshot, current: &SessionSnapshot) -> Vec<String> {
    let mut lines = Vec::new();

    if previous.connection_status != current.connection_status {
        lines.push(format!("* {}", current.connection_status));
    }
    if current.error != previous.error {
        if let Some(error) = &current.error {
            lines.push(format!("! {}", error));
        }
    }
    if previous.agent_present != current.agent_present {
        lines.push(if current.agent_present {
            "* agent joined".to_string()
        } else {
            "* agent left".to_string()
        });
    }
    if previous.is_speaking != current.is_speaking {
        lines.push(if current.is_speaking {
            "* microphone on".to_string()
        } else {
            "* microphone off".to_string()
        });
    }
    if previous.volume != current.volume {
        lines.push(format!("* volume {:.0}", current.volume));
    }

    // History is append-only, so anything past the old length is new.
    for message in current.chat_messages.iter().skip(previous.chat_messages.len()) {
        let who = match message.sender {
            ChatSender::User => "you",
            ChatSender::Agent => "agent",
        };
        lines.push(format!("[{}] {}: {}", message.sent_at.format("%H:%M:%S"), who, message.text));
    }
    lines
}

/// Full state summary for `/status`.
pub fn describe_status(snapshot: &SessionSnapshot) -> String {
    let mut summary = format!(
        "status: {}  mic: {}  agent: {}  volume: {:.0}",
        snapshot.connection_status,
        if snapshot.is_speaking { "on" } else { "off" },
        if snapshot.agent_present { "present" } else { "absent" },
        snapshot.volume,
    );
    if snapshot.connection_status == ConnectionStatus::Connected {
        summary.push('\n');
        summary.push_str(&describe_levels(snapshot));
    }
    if let Some(error) = &snapshot.error {
        summary.push_str(&format!("\nlast error: {}", error));
    }
    summary
}

pub fn describe_levels(snapshot: &SessionSnapshot) -> String {
    format!(
        "you   {} {:>3}\nagent {} {:>3}",
        level_bar(snapshot.audio_level),
        snapshot.audio_level,
        level_bar(snapshot.agent_audio_level),
        snapshot.agent_audio_level,
    )
}

pub fn level_bar(level: u8) -> String {
    let filled = (level.min(100) as usize * METER_WIDTH).div_ceil(100);
    format!("[{}{}]", "#".repeat(filled), " ".repeat(METER_WIDTH - filled))
}
