//! Wire records exchanged with the parent controller.
//!
//! Every record is a JSON object tagged by its `type` field and travels on
//! a line of its own.

use serde::{Deserialize, Serialize};

/// Records sent from this process to the parent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Emitted once at startup, before any control record is read.
    Ready,
    /// A fragment is asking the parent a question.
    LlmQuery {
        sub_context: String,
        instruction: String,
        id: String,
    },
    /// The outcome of one `exec`.
    ExecDone(CompletionRecord),
    /// Acknowledges `set_context`.
    ContextSet,
    /// Acknowledges `reset_final`.
    FinalReset,
}

/// Records sent from the parent to this process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// The answer to an earlier `llm_query`.
    LlmResult {
        id: String,
        #[serde(default)]
        result: Option<String>,
    },
    /// Run a fragment.
    Exec {
        #[serde(default)]
        code: String,
        /// Explicit suspension declaration; `None` lets the engine decide.
        #[serde(default)]
        suspend: Option<bool>,
    },
    /// Overwrite the context variable.
    SetContext {
        #[serde(default)]
        value: String,
    },
    /// Clear the final-result sentinel.
    ResetFinal,
    /// Stop the dispatch loop.
    Shutdown,
    /// Any other `type`.
    #[serde(other)]
    Unknown,
}

impl Inbound {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::LlmResult { .. } => "llm_result",
            Inbound::Exec { .. } => "exec",
            Inbound::SetContext { .. } => "set_context",
            Inbound::ResetFinal => "reset_final",
            Inbound::Shutdown => "shutdown",
            Inbound::Unknown => "unknown",
        }
    }
}

/// The report of one fragment execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionRecord {
    pub stdout: String,
    pub stderr: String,
    pub has_final: bool,
    pub final_value: Option<String>,
}

impl CompletionRecord {
    /// Build a record from the captured text and the sentinel state.
    pub fn new(stdout: String, stderr: String, final_value: Option<String>) -> Self {
        Self {
            stdout,
            stderr,
            has_final: final_value.is_some(),
            final_value,
        }
    }
}
