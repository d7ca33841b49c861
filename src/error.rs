use thiserror::Error;

/// Domain and execution errors surfaced by the CRI verb set. Each variant's
/// message is what the calling peer receives in the error envelope.
#[derive(Debug, Error)]
pub enum Error {
    #[error("already exists a sandbox with duplicate name/namespace")]
    DuplicateSandboxName,

    #[error("already exists a sandbox with duplicate uid")]
    DuplicateSandboxUid,

    #[error("sandbox not found")]
    SandboxNotFound,

    #[error("sandbox is not ready")]
    SandboxNotReady,

    #[error("the container having a duplicate name exists")]
    DuplicateContainerName,

    #[error("container not found")]
    ContainerNotFound,

    #[error("container was already started")]
    ContainerAlreadyStarted,

    #[error("image not found:{0}")]
    ImageNotFound(String),

    #[error("download error on pullImage:{0}")]
    ImagePull(String),

    #[error("failed to spawn execution context: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, Error>;
