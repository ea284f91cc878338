//! Persistent code-execution backend driven over line-delimited JSON.
//!
//! A parent process sends Lua fragments; they run one at a time against a
//! single global scope that lives for the whole process. Fragments can call
//! back into the parent with `llm_query` (blocking) or `async_llm_query`
//! plus `await`/`gather` (fan-out), and end the parent's loop by calling
//! `FINAL` or `FINAL_VAR`. Each run is answered with an `exec_done` record
//! carrying the captured output.

mod bridge;
mod capture;
mod channel;
mod error;
mod host;
mod interpreter;
mod protocol;
mod session;
mod suspend;

pub use bridge::{QueryBridge, DEFAULT_TOKEN_LEN, TOKEN_LEN_RANGE};
pub use capture::{Redirect, Stream, Streams};
pub use channel::Channel;
pub use error::Error;
pub use host::{FinalSlot, CONTEXT_GLOBAL};
pub use interpreter::{Interpreter, InterpreterOptions, DEFAULT_CHUNK_NAME};
pub use protocol::{CompletionRecord, Inbound, Outbound};
pub use session::{Exit, Session};
pub use suspend::{needs_suspension, ExecMode, PAUSE_POINTS};

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, Error>;
