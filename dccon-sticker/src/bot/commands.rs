//! Command text parsing.

use crate::domain::PackId;

pub const CREATE_USAGE: &str = "Usage: /create <dccon id> [-c]";
pub const CANCEL_USAGE: &str = "Usage: /cancel [dccon id]";

pub const HELP_TEXT: &str = "\
/create <dccon id> - turn a dccon pack into a sticker set\n\
/create <dccon id> -c - put stickers past the 50th into a second set\n\
/cancel [dccon id] - cancel your running job\n\
/help - show this message";

/// A recognised bot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Create { pack_id: PackId, split_overflow: bool },
    Cancel { pack_id: Option<PackId> },
    Stop,
    /// A known command with bad arguments; carries the usage line to reply with.
    Malformed { usage: &'static str },
    Unknown(String),
}

/// Parse `text` as a command. Returns `None` for plain messages.
///
/// Accepts the `/command@botname` form used in group chats.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let mut tokens = rest.split_whitespace();
    let head = tokens.next()?;
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    let args: Vec<&str> = tokens.collect();

    let command = match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "create" => {
            let split_overflow = args.contains(&"-c");
            let ids: Vec<&str> = args.iter().copied().filter(|a| *a != "-c").collect();
            match ids.as_slice() {
                [id] => match id.parse::<PackId>() {
                    Ok(pack_id) => Command::Create {
                        pack_id,
                        split_overflow,
                    },
                    Err(_) => Command::Malformed {
                        usage: CREATE_USAGE,
                    },
                },
                _ => Command::Malformed {
                    usage: CREATE_USAGE,
                },
            }
        }
        "cancel" => match args.as_slice() {
            [] => Command::Cancel { pack_id: None },
            [id] => match id.parse::<PackId>() {
                Ok(pack_id) => Command::Cancel {
                    pack_id: Some(pack_id),
                },
                Err(_) => Command::Malformed {
                    usage: CANCEL_USAGE,
                },
            },
            _ => Command::Malformed {
                usage: CANCEL_USAGE,
            },
        },
        "stop" => Command::Stop,
        other => Command::Unknown(other.to_string()),
    };

    Some(command)
}

/// A `y`/`n` answer to a pending confirmation.
pub fn is_confirmation(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("y")
}
