//! The execution engine: one persistent Lua scope, one fragment at a time.

use std::rc::Rc;

use mlua::Lua;

use crate::bridge::QueryBridge;
use crate::capture::{Redirect, Stream, Streams};
use crate::error::Error;
use crate::host::{self, FinalSlot, CONTEXT_GLOBAL};
use crate::protocol::CompletionRecord;
use crate::suspend::ExecMode;

/// Name fragments carry in diagnostics unless configured otherwise.
pub const DEFAULT_CHUNK_NAME: &str = "<repl>";

/// Knobs for an [`Interpreter`].
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    /// Name shown for fragments in error messages and tracebacks.
    pub chunk_name: String,
    /// Mode used when an `exec` does not declare one.
    pub default_mode: ExecMode,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            chunk_name: DEFAULT_CHUNK_NAME.to_string(),
            default_mode: ExecMode::Auto,
        }
    }
}

/// Runs fragments against a scope that lives as long as the interpreter.
///
/// Globals assigned by one fragment are visible to every later one. Output
/// is captured per run, and errors raised by a fragment end up in the
/// completion record rather than escaping `run`.
pub struct Interpreter {
    lua: Lua,
    bridge: Rc<QueryBridge>,
    streams: Rc<Streams>,
    final_slot: Rc<FinalSlot>,
    chunk_name: String,
    default_mode: ExecMode,
}

impl Interpreter {
    pub fn new(bridge: Rc<QueryBridge>) -> crate::Result<Self> {
        Self::with_options(bridge, InterpreterOptions::default())
    }

    pub fn with_options(
        bridge: Rc<QueryBridge>,
        options: InterpreterOptions,
    ) -> crate::Result<Self> {
        let lua = Lua::new();
        let streams = Rc::new(Streams::new());
        let final_slot = Rc::new(FinalSlot::default());
        host::install(
            &lua,
            Rc::clone(&streams),
            Rc::clone(&bridge),
            Rc::clone(&final_slot),
        )?;

        Ok(Self {
            lua,
            bridge,
            streams,
            final_slot,
            chunk_name: format!("={}", options.chunk_name),
            default_mode: options.default_mode,
        })
    }

    /// Overwrite the `context` global.
    pub fn set_context(&self, value: &str) -> crate::Result<()> {
        self.lua.globals().set(CONTEXT_GLOBAL, value)?;
        Ok(())
    }

    /// Current value of the `context` global, as a string.
    pub fn context(&self) -> crate::Result<String> {
        let value: mlua::Value = self.lua.globals().get(CONTEXT_GLOBAL)?;
        let tostring: mlua::Function = self.lua.globals().get("tostring")?;
        let text: String = tostring.call(value)?;
        Ok(text)
    }

    pub fn reset_final(&self) {
        self.final_slot.clear();
    }

    pub fn final_value(&self) -> Option<String> {
        self.final_slot.get()
    }

    /// Run one fragment and report what happened.
    ///
    /// `suspend` is the caller's declaration; `None` falls back to the
    /// configured default mode, which for `Auto` means a scan of the
    /// fragment for pause points. The fragment is executed exactly once.
    pub fn run(&self, code: &str, suspend: Option<bool>) -> CompletionRecord {
        let mode = self.default_mode.with_declaration(suspend).resolve(code);
        tracing::debug!(?mode, bytes = code.len(), "running fragment");

        let capture = Redirect::begin(Rc::clone(&self.streams), &self.lua);
        if let Err(err) = self.execute(code, mode) {
            tracing::info!(error = %err, "fragment raised an error");
            capture.write(Stream::Stderr, &render_error(&err));
        }
        let (stdout, stderr) = capture.finish();
        self.sweep_pending();

        CompletionRecord::new(stdout, stderr, self.final_slot.get())
    }

    /// Release queries whose handles no fragment can reach any more.
    ///
    /// Handles stored in globals survive and can be awaited by a later run.
    fn sweep_pending(&self) {
        if self.bridge.outstanding() == 0 {
            return;
        }
        if let Err(err) = self.lua.gc_collect() {
            tracing::warn!(error = %err, "could not collect unreachable query handles");
        }
        tracing::debug!(outstanding = self.bridge.outstanding(), "swept pending queries");
    }

    fn execute(&self, code: &str, mode: ExecMode) -> crate::Result<()> {
        let chunk = self.lua.load(code).set_name(self.chunk_name.as_str());
        match mode {
            ExecMode::Suspendable => {
                let runtime = tokio::runtime::Builder::new_current_thread().build()?;
                runtime.block_on(chunk.exec_async())?;
            }
            ExecMode::Direct | ExecMode::Auto => chunk.exec()?,
        }
        Ok(())
    }
}

/// Diagnostic text for a failed fragment, newline-terminated.
fn render_error(err: &Error) -> String {
    let mut text = match err {
        Error::Lua(inner) => inner.to_string(),
        other => other.to_string(),
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::io::{self, Cursor};

    fn interpreter_and_bridge(input: &str) -> (Interpreter, Rc<QueryBridge>) {
        let channel = Rc::new(Channel::new(
            Cursor::new(input.as_bytes().to_vec()),
            io::sink(),
        ));
        let mut n = 0;
        let bridge = Rc::new(QueryBridge::with_tokens(channel, move || {
            n += 1;
            format!("q{n}")
        }));
        (Interpreter::new(Rc::clone(&bridge)).unwrap(), bridge)
    }

    fn interpreter_with_input(input: &str) -> Interpreter {
        interpreter_and_bridge(input).0
    }

    #[test]
    fn test_new_interpreter() {
        let interp = interpreter_with_input("");
        assert_eq!(interp.final_value(), None);
        assert_eq!(interp.context().unwrap(), "");
    }

    #[test]
    fn test_run_captures_print() {
        let interp = interpreter_with_input("");
        let record = interp.run("print('hello')", None);
        assert_eq!(record.stdout, "hello\n");
        assert_eq!(record.stderr, "");
        assert!(!record.has_final);
        assert_eq!(record.final_value, None);
    }

    #[test]
    fn test_run_empty_fragment() {
        let interp = interpreter_with_input("");
        let record = interp.run("", None);
        assert_eq!(record, CompletionRecord::default());
    }

    #[test]
    fn test_scope_persists_between_runs() {
        let interp = interpreter_with_input("");
        interp.run("counter = 1", None);
        interp.run("counter = counter + 1", None);
        let record = interp.run("print(counter)", None);
        assert_eq!(record.stdout, "2\n");
    }

    #[test]
    fn test_error_is_captured_not_raised() {
        let interp = interpreter_with_input("");
        let record = interp.run("print('before'); error('boom')", None);
        assert_eq!(record.stdout, "before\n");
        assert!(record.stderr.contains("boom"));
        assert!(record.stderr.contains("<repl>"));
        assert!(record.stderr.ends_with('\n'));
    }

    #[test]
    fn test_syntax_error_is_reported_once() {
        let interp = interpreter_with_input("");
        let record = interp.run("print('side effect') x = = 1", None);
        assert_eq!(record.stdout, "");
        assert!(!record.stderr.is_empty());
    }

    #[test]
    fn test_error_keeps_previous_final() {
        let interp = interpreter_with_input("");
        interp.run("FINAL('kept')", None);
        let record = interp.run("error('later failure')", None);
        assert!(record.has_final);
        assert_eq!(record.final_value.as_deref(), Some("kept"));
        assert!(!record.stderr.is_empty());
    }

    #[test]
    fn test_final_literal() {
        let interp = interpreter_with_input("");
        let record = interp.run("FINAL(\"42\")", None);
        assert_eq!(
            record,
            CompletionRecord {
                stdout: String::new(),
                stderr: String::new(),
                has_final: true,
                final_value: Some("42".to_string()),
            }
        );
    }

    #[test]
    fn test_reset_final() {
        let interp = interpreter_with_input("");
        interp.run("FINAL('x')", None);
        interp.reset_final();
        let record = interp.run("y = 1", None);
        assert!(!record.has_final);
    }

    #[test]
    fn test_context_round_trip() {
        let interp = interpreter_with_input("");
        interp.set_context("the document").unwrap();
        let record = interp.run("print(context)", None);
        assert_eq!(record.stdout, "the document\n");
        assert_eq!(interp.context().unwrap(), "the document");
    }

    #[test]
    fn test_suspendable_fragment_runs_to_completion() {
        let interp = interpreter_with_input(
            "{\"type\":\"llm_result\",\"id\":\"q1\",\"result\":\"green\"}\n",
        );
        let record = interp.run(
            "local answer = await(async_llm_query(context, 'color?'))\nprint(answer)",
            None,
        );
        assert_eq!(record.stdout, "green\n");
        assert_eq!(record.stderr, "");
    }

    #[test]
    fn test_explicit_suspend_on_plain_code() {
        let interp = interpreter_with_input("");
        let direct = interp.run("print(1 + 1)", Some(false));
        let suspended = interp.run("print(1 + 1)", Some(true));
        assert_eq!(direct, suspended);
    }

    #[test]
    fn test_suspendable_globals_persist() {
        let interp = interpreter_with_input("");
        interp.run("shared = await('value')", None);
        let record = interp.run("print(shared)", None);
        assert_eq!(record.stdout, "value\n");
    }

    #[test]
    fn test_rebinding_print_lasts_one_run() {
        let interp = interpreter_with_input("");
        let first = interp.run("print = function() end; print('hidden')", None);
        assert_eq!(first.stdout, "");
        let second = interp.run("print('visible')", None);
        assert_eq!(second.stdout, "visible\n");
    }

    #[test]
    fn test_closed_channel_surfaces_in_stderr() {
        let interp = interpreter_with_input("");
        let record = interp.run("print('asking'); local a = llm_query('ctx', 'q')", None);
        assert_eq!(record.stdout, "asking\n");
        assert!(record.stderr.contains("channel closed"));
    }

    #[test]
    fn test_custom_chunk_name() {
        let channel = Rc::new(Channel::new(Cursor::new(Vec::new()), io::sink()));
        let bridge = Rc::new(QueryBridge::new(channel));
        let options = InterpreterOptions {
            chunk_name: "cell".to_string(),
            default_mode: ExecMode::Direct,
        };
        let interp = Interpreter::with_options(bridge, options).unwrap();
        let record = interp.run("error('bad')", None);
        assert!(record.stderr.contains("cell:1:"));
    }

    #[test]
    fn test_default_output_is_captured() {
        let interp = interpreter_with_input("");
        let record = interp.run(
            "io.output():write('via output\\n'); io.stdout:write('direct\\n')",
            None,
        );
        assert_eq!(record.stdout, "via output\ndirect\n");
    }

    #[test]
    fn test_unawaited_queries_are_released() {
        let (interp, bridge) = interpreter_and_bridge(
            "{\"type\":\"llm_result\",\"id\":\"q2\",\"result\":\"B\"}\n",
        );
        let record = interp.run(
            "local a = async_llm_query('a'); local b = async_llm_query('b'); print(await(b))",
            None,
        );
        assert_eq!(record.stdout, "B\n");
        assert_eq!(bridge.outstanding(), 0);
    }

    #[test]
    fn test_global_handle_survives_run() {
        let (interp, bridge) = interpreter_and_bridge(
            "{\"type\":\"llm_result\",\"id\":\"q1\",\"result\":\"later\"}\n",
        );
        interp.run("pending = async_llm_query('doc')", None);
        assert_eq!(bridge.outstanding(), 1);

        let record = interp.run("print(await(pending))", None);
        assert_eq!(record.stdout, "later\n");
        assert_eq!(bridge.outstanding(), 0);
    }
}
