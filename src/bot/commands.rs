//! Prefix command parsing.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join,
    Leave,
    Play(String),
    Pause,
    Resume,
    Skip,
    Stop,
    Queue,
    Clear,
    Shuffle,
    NowPlaying,
    Help,
    Unknown(String),
}

impl Command {
    /// Commands that tear down shared state for everyone in the guild.
    pub fn is_moderator_only(&self) -> bool {
        matches!(self, Command::Leave | Command::Clear)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Join => "join",
            Command::Leave => "leave",
            Command::Play(_) => "play",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Skip => "skip",
            Command::Stop => "stop",
            Command::Queue => "queue",
            Command::Clear => "clear",
            Command::Shuffle => "shuffle",
            Command::NowPlaying => "np",
            Command::Help => "help",
            Command::Unknown(name) => name,
        };
        f.write_str(name)
    }
}

/// Parses a chat message. Returns `None` when the message is not addressed
/// to the bot; a bare prefix means help.
pub fn parse(prefix: &str, content: &str) -> Option<Command> {
    let rest = content.trim_start().strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        // "!musical" is not "!music al"
        return None;
    }

    let rest = rest.trim();
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let command = match name.to_lowercase().as_str() {
        "" | "help" => Command::Help,
        "join" => Command::Join,
        "leave" => Command::Leave,
        "play" => Command::Play(args.to_string()),
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "skip" => Command::Skip,
        "stop" => Command::Stop,
        "queue" | "list" => Command::Queue,
        "clear" => Command::Clear,
        "shuffle" => Command::Shuffle,
        "np" | "current" | "now-playing" => Command::NowPlaying,
        other => Command::Unknown(other.to_string()),
    };
    Some(command)
}

pub fn help_text(prefix: &str) -> String {
    [
        ("join", "Join your voice channel"),
        ("leave", "Leave the voice channel and drop the queue"),
        ("play <url or search>", "Add a track to the queue"),
        ("pause", "Pause the current track"),
        ("resume", "Resume playback"),
        ("skip", "Skip the current track"),
        ("stop", "Stop the current track and hold the queue"),
        ("queue", "Show the queue"),
        ("np", "Show the track that's playing"),
        ("shuffle", "Shuffle the queue"),
        ("clear", "Remove every queued track"),
        ("help", "Show this message"),
    ]
    .iter()
    .map(|(usage, about)| format!("`{prefix} {usage}` - {about}"))
    .collect::<Vec<_>>()
    .join("\n")
}
