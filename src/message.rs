use crate::protocol::ServerLine;
use crate::types::ScreenName;

/// Separates the receiver's name from the rest of a private line.
pub const PRIVATE_DELIMITER: &str = ">>";

/// A line received from an active session, classified for routing.
///
/// Both variants borrow from the input line and the sender's name;
/// nothing is copied until the line is rendered for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    /// Delivered to every active session, the sender included.
    Broadcast { sender: &'a ScreenName, body: &'a str },
    /// Delivered to `receiver` and echoed to the sender. `raw` is the
    /// whole line, receiver prefix and delimiter included.
    Private { raw: &'a str, receiver: &'a str },
}

impl<'a> Message<'a> {
    /// Classify a line. Anything before the first `>>` is the receiver.
    pub fn classify(sender: &'a ScreenName, line: &'a str) -> Self {
        match line.split_once(PRIVATE_DELIMITER) {
            Some((receiver, _)) => Message::Private { raw: line, receiver },
            None => Message::Broadcast { sender, body: line },
        }
    }

    /// The `MESSAGE` line delivered to recipients.
    pub fn render(&self) -> ServerLine {
        match self {
            Message::Broadcast { sender, body } => ServerLine::Message(format!("{sender}: {body}")),
            Message::Private { raw, .. } => ServerLine::Message(format!(" [Private]: {raw}")),
        }
    }
}
