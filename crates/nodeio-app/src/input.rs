//! Line-oriented player input read from stdin.

use std::str::FromStr;

use nodeio_world::Direction;

/// One line of player input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `up`, `down`, `left` or `right`.
    Move(Direction),
    /// `say <text>`.
    Say(String),
    /// `quit`.
    Quit,
}

/// Error returned for a line that is not a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    /// `say` with nothing after it.
    #[error("`say` needs a message")]
    EmptyMessage,
    /// Anything else.
    #[error("unknown command `{0}` (try up, down, left, right, say <text>, quit)")]
    Unknown(String),
}

/// Parse a line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Input>, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    match word.to_ascii_lowercase().as_str() {
        "say" => {
            let message = rest.trim();
            if message.is_empty() {
                Err(InputError::EmptyMessage)
            } else {
                Ok(Some(Input::Say(message.to_string())))
            }
        }
        "quit" | "exit" => Ok(Some(Input::Quit)),
        _ => Direction::from_str(word)
            .map(|direction| Some(Input::Move(direction)))
            .map_err(|_| InputError::Unknown(line.to_string())),
    }
}
