use thiserror::Error;

/// Request rejected by the gateway before any job exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid hash {0}")]
    InvalidHash(String),

    #[error("Invalid run id {0}")]
    InvalidRunId(String),

    #[error("Invalid team {0}")]
    InvalidTeam(String),

    #[error("Invalid script url {0}")]
    InvalidScriptUrl(String),

    #[error("Invalid script name {0}")]
    InvalidScriptName(String),

    #[error("Malformed frame, expected {expected} fields")]
    MalformedFrame { expected: usize },
}

/// The pipeline step a [`StageError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    RepoSync,
    Secrets,
    Build,
    Staging,
    Upload,
    Flash,
    PostUpload,
    Fetch,
    HostUpdate,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::RepoSync => write!(f, "commit not found"),
            StageKind::Secrets => write!(f, "secret generation failed"),
            StageKind::Build => write!(f, "build failed"),
            StageKind::Staging => write!(f, "artifact staging failed"),
            StageKind::Upload => write!(f, "upload failed"),
            StageKind::Flash => write!(f, "flash failed"),
            StageKind::PostUpload => write!(f, "remote run failed"),
            StageKind::Fetch => write!(f, "script download failed"),
            StageKind::HostUpdate => write!(f, "host update failed"),
        }
    }
}

/// A terminal failure of one job stage, with whatever the process printed.
#[derive(Error, Debug)]
#[error("{kind}: {detail}")]
pub struct StageError {
    pub kind: StageKind,
    pub detail: String,
    pub output: Vec<u8>,
}

impl StageError {
    pub fn new(kind: StageKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            output: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: Vec<u8>) -> Self {
        self.output = output;
        self
    }

    pub fn timed_out(kind: StageKind, after: std::time::Duration) -> Self {
        Self::new(kind, format!("timed out after {}s", after.as_secs()))
    }

    pub fn is_timeout(&self) -> bool {
        self.detail.starts_with("timed out")
    }
}

/// Classified failure of an artifact transfer.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Broken pipe mid-transfer; worth another attempt.
    #[error("broken pipe during transfer to {host}")]
    BrokenPipe { host: String, output: Vec<u8> },

    /// The host itself went away.
    #[error("host {host} disconnected")]
    Disconnected { host: String, output: Vec<u8> },

    #[error("transfer to {host} failed: {detail}")]
    Failed {
        host: String,
        detail: String,
        output: Vec<u8>,
    },
}

impl TransportError {
    pub fn into_stage_error(self) -> StageError {
        let detail = self.to_string();
        let output = match self {
            TransportError::BrokenPipe { output, .. }
            | TransportError::Disconnected { output, .. }
            | TransportError::Failed { output, .. } => output,
        };
        StageError::new(StageKind::Upload, detail).with_output(output)
    }
}

#[derive(Error, Debug)]
pub enum CiError {
    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Read timed out")]
    ReadTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CiError>;
