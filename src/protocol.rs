use std::fmt;
use std::str::FromStr;

use crate::error::ChatError;
use crate::types::ScreenName;

/// Lines the server sends to a client, one per `\n`-terminated line.
///
///   SUBMITNAME            — propose a screen name
///   NAMEACCEPTED          — handshake complete
///   MESSAGE <text>        — text to display
///   ENTERCLIENT<name>     — a peer joined
///   LEAVECLIENT<name>     — a peer left
///
/// `ENTERCLIENT` and `LEAVECLIENT` carry the name with no separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    SubmitName,
    NameAccepted,
    Message(String),
    EnterClient(ScreenName),
    LeaveClient(ScreenName),
}

const SUBMIT_NAME: &str = "SUBMITNAME";
const NAME_ACCEPTED: &str = "NAMEACCEPTED";
const MESSAGE: &str = "MESSAGE ";
const ENTER_CLIENT: &str = "ENTERCLIENT";
const LEAVE_CLIENT: &str = "LEAVECLIENT";

impl ServerLine {
    pub fn joined(name: &ScreenName) -> Self {
        ServerLine::Message(format!("{name} has joined the Chat!"))
    }

    pub fn left(name: &ScreenName) -> Self {
        ServerLine::Message(format!("{name} has left the Chat!"))
    }

    pub fn not_found(receiver: &str) -> Self {
        ServerLine::Message(format!("{receiver} is not found"))
    }
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLine::SubmitName => f.write_str(SUBMIT_NAME),
            ServerLine::NameAccepted => f.write_str(NAME_ACCEPTED),
            ServerLine::Message(text) => write!(f, "{MESSAGE}{text}"),
            ServerLine::EnterClient(name) => write!(f, "{ENTER_CLIENT}{name}"),
            ServerLine::LeaveClient(name) => write!(f, "{LEAVE_CLIENT}{name}"),
        }
    }
}

/// Decode a server line on the client side.
impl FromStr for ServerLine {
    type Err = ChatError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line == SUBMIT_NAME {
            return Ok(ServerLine::SubmitName);
        }
        if line == NAME_ACCEPTED {
            return Ok(ServerLine::NameAccepted);
        }
        if let Some(text) = line.strip_prefix(MESSAGE) {
            return Ok(ServerLine::Message(text.to_string()));
        }
        if let Some(name) = line.strip_prefix(ENTER_CLIENT) {
            return Ok(ServerLine::EnterClient(ScreenName::parse(name, usize::MAX)?));
        }
        if let Some(name) = line.strip_prefix(LEAVE_CLIENT) {
            return Ok(ServerLine::LeaveClient(ScreenName::parse(name, usize::MAX)?));
        }
        Err(ChatError::Parse(format!("unknown server line: {line}")))
    }
}
