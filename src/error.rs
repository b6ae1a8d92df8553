use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by nodes, the supervisor, and the datastores.
#[derive(Debug, Error)]
pub enum Error {
    /// The rendezvous socket already exists, so another process holds the
    /// leader role. The supervisor treats this as a signal to attach as a
    /// follower rather than as a failure.
    #[error("leader already exists")]
    LeaderAlreadyExists,

    /// The rendezvous socket exists but nothing is listening on it. The
    /// supervisor deletes the stale socket and retries.
    #[error("leader closed")]
    LeaderClosed,

    /// The rendezvous path exists but is not a unix stream socket.
    #[error("invalid socket")]
    InvalidSocket,

    /// An optimistic write raced another writer.
    #[error("version mismatch")]
    VersionMismatch,

    /// The leader accepted the request but its datastore put failed.
    #[error("leader failed to write")]
    LeaderFailedToWrite,

    /// The node behind this handle has been closed or replaced.
    #[error("node is closed")]
    NodeClosed,

    /// The leader never sent the initial state broadcast.
    #[error("timed out waiting for initial state")]
    BootstrapTimeout,

    /// Role acquisition gave up after exhausting its retry budget.
    #[error("maximum number of attempts reached")]
    RetriesExhausted,

    /// A frame carried a message type the invoked parser does not accept.
    #[error("unexpected message type {0}")]
    UnexpectedMessageType(u16),

    /// A frame body ended before its fixed-size fields.
    #[error("truncated message body")]
    TruncatedMessage,

    /// An update response carried a response code this version does not know.
    #[error("unknown response code {0}")]
    UnknownResponseCode(u16),

    /// An append-only log file declares an unsupported format version.
    #[error("unexpected file version")]
    UnexpectedFileVersion,

    /// An append-only log header points past the end of the file.
    #[error("offset is out of range")]
    OffsetOutOfRange,

    /// An append-only log header places the current value past its own end
    /// marker.
    #[error("offset is greater than next offset")]
    NextOffsetOutOfRange,

    /// A datastore operation was attempted before `open` or after `close`.
    #[error("file is not open")]
    FileNotOpen,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
