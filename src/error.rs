use std::path::PathBuf;

/// Rejections raised while validating a run, before any cluster interaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown nemesis generator '{name}', valid options: {}", .valid.join(", "))]
    UnknownFaultGenerator { name: String, valid: Vec<String> },

    #[error("unknown client generator '{name}', valid options: {}", .valid.join(", "))]
    UnknownClientGenerator { name: String, valid: Vec<String> },

    #[error("unknown cluster component '{name}', valid options: {}", .valid.join(", "))]
    UnknownComponent { name: String, valid: Vec<String> },

    #[error("job-running-healthy-threshold must be a positive integer, got {0}")]
    ThresholdOutOfRange(u32),

    #[error("job-recovery-grace-period must be at least {min}s, got {got}s")]
    GracePeriodTooShort { got: u64, min: u64 },

    #[error("{name} must be positive, got {got}")]
    NonPositive { name: &'static str, got: u64 },

    #[error("{name} must be at most {max}s, got {got}s")]
    TooLarge {
        name: &'static str,
        got: u64,
        max: u64,
    },

    #[error("failed to read test spec {path}: {reason}")]
    TestSpecUnreadable { path: PathBuf, reason: String },

    #[error("malformed test spec {path}: {reason}")]
    MalformedTestSpec { path: PathBuf, reason: String },
}

/// Failures talking to the cluster or its control agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("{op} request failed: {reason}")]
    Request { op: String, reason: String },

    #[error("{op} returned {status}: {body}")]
    Status { op: String, status: u16, body: String },

    #[error("failed to parse {op} response: {reason}")]
    Decode { op: String, reason: String },

    #[error("no running job to cancel")]
    NoRunningJob,

    #[error("component '{component}': {source}")]
    Component {
        component: String,
        source: Box<ClusterError>,
    },

    #[error("{source}; rollback also failed: {rollback}")]
    RollbackFailed {
        source: Box<ClusterError>,
        rollback: Box<ClusterError>,
    },
}

/// Top-level error for anything that aborts a run instead of producing a verdict.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cluster unavailable: {0}")]
    Cluster(#[from] ClusterError),

    #[error("job cancellation failed: {0}")]
    CancelFailed(ClusterError),

    #[error("failed to write results to {path}: {reason}")]
    Output { path: PathBuf, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
