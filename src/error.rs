use std::path::PathBuf;

/// Broad error category used by the HTTP layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Auth,
    NotFound,
    Conflict,
    RemoteTransient,
    RemotePermanent,
    Timeout,
    Corruption,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Remote VCS or LLM failure that is worth retrying.
    #[error("transient remote error: {0}")]
    RemoteTransient(String),

    /// Remote VCS or LLM failure that will not go away on retry.
    #[error("remote error: {0}")]
    RemotePermanent(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("store corrupted: {0}")]
    Corruption(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("worktree error: {0}")]
    Worktree(String),

    #[error("setup error: {0}")]
    Setup(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("pubsub error: {0}")]
    PubSub(String),

    #[error("review assembly error: {0}")]
    Assemble(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map every variant to its taxonomy kind. The HTTP layer derives status
    /// codes from the kind so new variants cannot silently fall through to 500.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigNotFound(_)
            | Error::ConfigParse(_)
            | Error::ConfigValidation(_)
            | Error::InvalidInput(_)
            | Error::Prompt(_)
            | Error::Assemble(_) => ErrorKind::Input,
            Error::Auth(_) => ErrorKind::Auth,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::RemoteTransient(_) => ErrorKind::RemoteTransient,
            Error::RemotePermanent(_) | Error::Git(_) => ErrorKind::RemotePermanent,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Io(_)
            | Error::Store(_)
            | Error::Worktree(_)
            | Error::Setup(_)
            | Error::Scheduler(_)
            | Error::PubSub(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when a bounded-backoff retry is appropriate.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::RemoteTransient)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::InvalidInput("x".into()).kind(), ErrorKind::Input);
        assert_eq!(Error::Auth("no token".into()).kind(), ErrorKind::Auth);
        assert_eq!(Error::NotFound("s".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Conflict("c".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            Error::RemoteTransient("503".into()).kind(),
            ErrorKind::RemoteTransient
        );
        assert_eq!(
            Error::RemotePermanent("404 from host".into()).kind(),
            ErrorKind::RemotePermanent
        );
        assert_eq!(Error::Timeout("llm".into()).kind(), ErrorKind::Timeout);
        assert_eq!(Error::Corruption("db".into()).kind(), ErrorKind::Corruption);
        assert_eq!(Error::Internal("bug".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_transient_detection() {
        assert!(Error::RemoteTransient("502".into()).is_transient());
        assert!(!Error::RemotePermanent("401".into()).is_transient());
        assert!(!Error::Timeout("t".into()).is_transient());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::Worktree("fetch failed".into());
        assert_eq!(err.to_string(), "worktree error: fetch failed");
    }
}
