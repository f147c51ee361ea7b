use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

static COMMIT_HASH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{7,40}$").expect("commit hash pattern is valid")
});

/// Source revision plus the CI run that asked for it.
///
/// The same hash may be rebuilt under several run ids, so `run_id` is the
/// key used for anything stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub message: String,
    pub run_id: String,
}

impl CommitInfo {
    /// Build a validated record. Rejects anything that is not 7–40 lowercase
    /// hex characters and run ids that could escape the builds directory.
    pub fn new(
        hash: impl Into<String>,
        author: impl Into<String>,
        message: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let hash = hash.into();
        if !is_valid_hash(&hash) {
            return Err(ValidationError::InvalidHash(hash));
        }
        let run_id = run_id.into();
        if !is_safe_path_component(&run_id) {
            return Err(ValidationError::InvalidRunId(run_id));
        }
        Ok(Self {
            hash,
            author: author.into(),
            message: message.into(),
            run_id,
        })
    }

    /// Parse the `build-ours` payload `"<hash>|<author>|<name>|<run_id>"`.
    pub fn parse_frame(frame: &str) -> Result<Self, ValidationError> {
        let parts: Vec<&str> = frame.split('|').collect();
        match parts.as_slice() {
            [hash, author, message, run_id] => Self::new(*hash, *author, *message, *run_id),
            _ => Err(ValidationError::MalformedFrame { expected: 4 }),
        }
    }

    pub fn short_hash(&self) -> &str {
        self.hash.get(..7).unwrap_or(&self.hash)
    }
}

pub fn is_valid_hash(hash: &str) -> bool {
    COMMIT_HASH.is_match(hash)
}

/// True for a non-empty name that cannot be used to walk out of a directory.
pub fn is_safe_path_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
