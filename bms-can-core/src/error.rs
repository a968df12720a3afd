//! Error types for every pipeline stage
//!
//! Each stage gets its own enum so the controller can apply the propagation
//! policy per condition: timeouts and retryable write failures are absorbed,
//! adapter loss and exhausted reconnects terminate the pipeline.

/// Frame construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid DLC: {0} bytes (max 8)")]
    InvalidDlc(usize),

    #[error("Identifier 0x{id:X} does not fit a {} frame", id_width(.extended))]
    InvalidIdentifier { id: u32, extended: bool },
}

fn id_width(extended: &bool) -> &'static str {
    if *extended {
        "29-bit"
    } else {
        "11-bit"
    }
}

/// Frame Source errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The adapter could not be opened (missing device, permissions, bad config)
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// No frame arrived within the read timeout (idle bus)
    #[error("Read timed out")]
    Timeout,

    /// The adapter went away; the handle must be re-acquired
    #[error("Port closed: {0}")]
    PortClosed(String),

    /// A finite source (replay, scripted) has no more frames
    #[error("Source exhausted")]
    Exhausted,
}

/// Store write errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The store refused the batch; retrying will not help
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// The store could not be reached; the batch may be retried
    #[error("Store unreachable: {0}")]
    Unreachable(String),
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Unreachable(_))
    }
}

/// Signal table loading errors
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Failed to read signal table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse signal table: {0}")]
    Parse(String),

    #[error("Failed to parse DBC file: {0}")]
    DbcParse(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Unsupported signal table format: {0}")]
    UnsupportedFormat(String),
}

/// Fatal pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Adapter unavailable at startup: {0}")]
    AdapterUnavailable(String),

    #[error("Adapter port closed and {attempts} reconnect attempts failed: {reason}")]
    PortClosed { attempts: u32, reason: String },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Flush worker failed: {0}")]
    Worker(String),
}
