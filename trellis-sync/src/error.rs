use thiserror::Error;

/// Errors produced by the sync layer.
///
/// Most of these never reach the mutation call site: propagation failures
/// are logged and counted, remote decode failures are treated as
/// "no update available".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// No cross-window host is present; the container runs local-only.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A value could not be turned into (or read back from) a JSON payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A wire frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The channel behind a container was closed by the host.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A registry entry exists under this id but holds another value type.
    #[error("container {id} holds a different value type")]
    TypeMismatch { id: String },

    /// A host command failed or is not registered.
    #[error("command `{name}` failed: {message}")]
    Command { name: String, message: String },

    /// The initial value producer of a query failed.
    #[error("fetch failed: {0}")]
    Fetch(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = SyncError::TypeMismatch { id: "battery-store".into() };
        assert_eq!(err.to_string(), "container battery-store holds a different value type");

        let err = SyncError::Command { name: "get_battery".into(), message: "not registered".into() };
        assert_eq!(err.to_string(), "command `get_battery` failed: not registered");
    }

    #[test]
    fn test_from_serde_json() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SyncError = bad.into();
        assert!(matches!(err, SyncError::Serialization(_)));
    }
}
