use std::borrow::Borrow;
use std::fmt;

use crate::error::ChatError;
use crate::message::PRIVATE_DELIMITER;

/// A screen name claimed by exactly one active session.
///
/// Names compare by value. `Borrow<str>` lets registry maps keyed by
/// `ScreenName` be queried with the raw receiver text of a private line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScreenName(String);

impl ScreenName {
    /// Validate a proposed name.
    ///
    /// The text is taken as-is (no trimming): a name that only matches
    /// after trimming could never be addressed with `name>>`.
    pub fn parse(raw: &str, max_len: usize) -> Result<Self, ChatError> {
        if raw.trim().is_empty() {
            return Err(ChatError::InvalidName("name is empty".into()));
        }
        if raw.chars().count() > max_len {
            return Err(ChatError::InvalidName(format!(
                "name is longer than {max_len} characters"
            )));
        }
        if raw.contains(PRIVATE_DELIMITER) {
            return Err(ChatError::InvalidName(format!(
                "name must not contain '{PRIVATE_DELIMITER}'"
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(ChatError::InvalidName(
                "name must not contain control characters".into(),
            ));
        }
        Ok(Self(raw.to_string()))
    }
}

impl Borrow<str> for ScreenName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ScreenName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ScreenName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl fmt::Display for ScreenName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
