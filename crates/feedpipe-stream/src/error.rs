use std::time::Duration;

use thiserror::Error;

/// Which kind of body writer a response has vended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterKind {
    Bytes,
    Chars,
}

impl std::fmt::Display for WriterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterKind::Bytes => f.write_str("byte stream"),
            WriterKind::Chars => f.write_str("character writer"),
        }
    }
}

/// Errors raised by a [`Response`](crate::Response).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot open a {requested}: response already uses a {claimed}")]
    WriterConflict {
        requested: WriterKind,
        claimed: WriterKind,
    },
}

/// Errors raised by a [`StreamBridge`](crate::StreamBridge).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("producer did not commit a response head within {0:?}")]
    FirstByteTimeout(Duration),

    #[error("producer went away without committing a response head")]
    ProducerGone,

    #[error("bridge reader already taken")]
    ReaderTaken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_both_writers() {
        let err = SinkError::WriterConflict {
            requested: WriterKind::Chars,
            claimed: WriterKind::Bytes,
        };
        assert_eq!(
            err.to_string(),
            "cannot open a character writer: response already uses a byte stream"
        );
    }

    #[test]
    fn timeout_message_includes_duration() {
        let err = BridgeError::FirstByteTimeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
