/// Line commands typed at the `spaces` prompt.
use spaces_core::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Mute,
    Deafen,
    Device(String),
    Devices,
    Roster,
    Peers,
    Level,
    Help,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingArgument(&'static str),
    Unknown(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty command"),
            ParseError::MissingArgument(cmd) => write!(f, "`{cmd}` needs an argument"),
            ParseError::Unknown(cmd) => write!(f, "unknown command `{cmd}` (try `help`)"),
        }
    }
}

pub const HELP: &str = "\
commands:
  mute            toggle microphone mute
  deafen          toggle speaker output
  device <id>     switch input device
  devices         list input devices
  roster          show who is in the space
  peers           show peer connection states
  level           show the current input level
  leave           leave the space and exit";

pub fn parse(line: &str) -> Result<ConsoleCommand, ParseError> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match head.to_ascii_lowercase().as_str() {
        "" => Err(ParseError::Empty),
        "mute" | "m" => Ok(ConsoleCommand::Mute),
        "deafen" | "d" => Ok(ConsoleCommand::Deafen),
        "device" => {
            if rest.is_empty() {
                Err(ParseError::MissingArgument("device"))
            } else {
                Ok(ConsoleCommand::Device(rest.to_owned()))
            }
        }
        "devices" => Ok(ConsoleCommand::Devices),
        "roster" | "who" => Ok(ConsoleCommand::Roster),
        "peers" => Ok(ConsoleCommand::Peers),
        "level" => Ok(ConsoleCommand::Level),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "leave" | "quit" | "exit" => Ok(ConsoleCommand::Leave),
        other => Err(ParseError::Unknown(other.to_owned())),
    }
}

/// Accepts the wire spelling (`co_host`) and a few forgiving variants.
pub fn parse_role(value: &str) -> Option<Role> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "host" => Some(Role::Host),
        "co_host" | "cohost" => Some(Role::CoHost),
        "speaker" => Some(Role::Speaker),
        "listener" => Some(Role::Listener),
        _ => None,
    }
}
