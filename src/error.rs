use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown rank `{0}`")]
    UnknownRank(String),

    #[error("unknown kind `{0}`")]
    UnknownKind(String),

    #[error("unknown container `{0}`")]
    UnknownContainer(String),

    #[error("unknown pipe `{0}`")]
    UnknownPipe(String),

    #[error("unknown pass `{0}`")]
    UnknownPass(String),

    #[error("unknown step `{0}`")]
    UnknownStep(String),

    #[error("global `{0}` is not registered")]
    GlobalNotFound(String),

    #[error("global `{name}` is not a `{expected}`")]
    GlobalTypeMismatch { name: String, expected: &'static str },

    #[error("invalid contract: {0}")]
    InvalidContract(String),

    #[error("invalid target `{0}`: {1}")]
    InvalidTarget(String, String),

    #[error(
        "cannot satisfy goal: step `{step}` needs {targets} in container `{container}` \
         and nothing provides it"
    )]
    UnsatisfiableGoal {
        step: String,
        container: String,
        targets: String,
    },

    #[error("pipe `{pipe}` failed: {source}")]
    PipeFailed {
        pipe: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("pipe `{pipe}` violated its contract: {detail}")]
    PipeContractViolation { pipe: String, detail: String },

    #[error("container `{container}` of type `{ty}` does not accept kind `{kind}`")]
    ContainerTypeMismatch {
        container: String,
        ty: String,
        kind: String,
    },

    #[error("cannot merge a `{other}` container into a `{this}`")]
    MergeMismatch {
        this: &'static str,
        other: &'static str,
    },

    #[error("malformed pipeline description: {0}")]
    Description(String),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persistence failures, always carrying the offending path.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read `{0}`: {1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("failed to write `{0}`: {1}")]
    Write(Utf8PathBuf, std::io::Error),

    #[error("failed to serialize `{0}`: {1}")]
    Serialize(Utf8PathBuf, String),

    #[error("failed to deserialize `{0}`: {1}")]
    Deserialize(Utf8PathBuf, String),
}
