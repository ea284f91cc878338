//! Error types for the evaluation backend.

use std::io;

use thiserror::Error;

/// Errors that can occur while serving the protocol or running fragments.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading from or writing to a protocol endpoint failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An outbound record could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The embedded interpreter reported an error.
    #[error("Lua error: {0}")]
    Lua(#[from] mlua::Error),

    /// The inbound endpoint reached end-of-stream while a query was
    /// still waiting for its answer. No answer can ever arrive after this.
    #[error("channel closed while waiting for the answer to query {id}")]
    ChannelClosed { id: String },

    /// A runtime error raised by the host itself.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Whether this error means the parent can no longer talk to us.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ChannelClosed { .. } | Error::Io(_))
    }
}

impl From<Error> for mlua::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Lua(inner) => inner,
            other => mlua::Error::external(other),
        }
    }
}
