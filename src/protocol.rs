//! Client wire format.
//!
//! Requests are short text frames, one per read:
//!
//! ```text
//! <token>|<command>
//! <command payload>            (command dependent, after the ack line)
//! ```
//!
//! Responses are free-form progress bytes closed by a single `%*&<code>\n`.

use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{CiError, Result, ValidationError};

/// Upper bound of a single request frame.
pub const MAX_FRAME: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    BuildOurs,
    AttackTarget,
    AttackScript,
    UpdateCi,
}

impl Command {
    /// First line written back once the command is recognised.
    pub fn ack(self) -> &'static str {
        match self {
            Command::BuildOurs => "[CONN] Building our design",
            Command::AttackTarget => "[CONN] Attacking target design",
            Command::AttackScript => "[CONN] Attacking target with manual attack script",
            Command::UpdateCi => "[CONN] Updating CI",
        }
    }
}

impl FromStr for Command {
    type Err = CiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "build-ours" => Ok(Command::BuildOurs),
            "attack-target" => Ok(Command::AttackTarget),
            "attack-script" => Ok(Command::AttackScript),
            "update-ci" => Ok(Command::UpdateCi),
            other => Err(CiError::UnknownCommand(other.to_string())),
        }
    }
}

/// Split `<token>|<command>`. The command name is only trimmed; it is parsed
/// after the token has been checked.
pub fn parse_request(frame: &str) -> std::result::Result<(&str, &str), ValidationError> {
    let (token, command) = frame
        .split_once('|')
        .ok_or(ValidationError::MalformedFrame { expected: 2 })?;
    Ok((token, command.trim()))
}

/// Compare tokens without an early exit on the first differing byte.
pub fn verify_token(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    let mut diff = a.len() ^ b.len();
    for (i, byte) in a.iter().enumerate() {
        diff |= usize::from(byte ^ b.get(i).copied().unwrap_or(0));
    }
    diff == 0
}

/// `<team>|<script_url>`
pub fn parse_attack_script(frame: &str) -> std::result::Result<(&str, &str), ValidationError> {
    frame
        .split_once('|')
        .ok_or(ValidationError::MalformedFrame { expected: 2 })
}

/// Read one frame: a single read of at most [`MAX_FRAME`] bytes, trailing
/// CR/LF removed. A closed peer is [`CiError::ClientDisconnected`].
pub async fn read_frame<R>(reader: &mut R, timeout: Duration) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_FRAME];
    let n = tokio::time::timeout(timeout, reader.read(&mut buf))
        .await
        .map_err(|_| CiError::ReadTimeout)??;
    if n == 0 {
        return Err(CiError::ClientDisconnected);
    }
    let frame = String::from_utf8_lossy(&buf[..n]);
    Ok(frame.trim_end_matches(['\r', '\n']).to_string())
}
