/// Category of a cluster error. Lets the engine and the gateway decide
/// how far a failure propagates (whole service, one request, one task).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The cluster cannot be reached. Fatal at startup.
    Connection,
    /// A topic or partition the request names does not exist.
    Lookup,
    /// A cursor failed mid-stream. Terminal for the owning task only.
    Read,
    /// The producer rejected or timed out a message.
    Publish,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connection => f.write_str("connection"),
            ErrorKind::Lookup => f.write_str("lookup"),
            ErrorKind::Read => f.write_str("read"),
            ErrorKind::Publish => f.write_str("publish"),
        }
    }
}

/// Unified error type for every `LogCluster` / `PartitionCursor` call.
///
/// Carries an `ErrorKind` for categorization and a human-readable
/// message from the underlying client library.
#[derive(Clone)]
pub struct ClusterError {
    kind: ErrorKind,
    message: String,
}

impl ClusterError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Connection, message: msg.into() }
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Lookup, message: msg.into() }
    }

    pub fn read(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Read, message: msg.into() }
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Publish, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prepend context to the message, keeping the kind.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        Self { kind: self.kind, message: format!("{ctx}: {}", self.message) }
    }
}

impl std::fmt::Debug for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClusterError {}
