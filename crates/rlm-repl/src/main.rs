//! RLM REPL worker - a persistent Lua scope driven by a parent controller.
//!
//! The parent writes one JSON record per line on our stdin and reads our
//! replies from stdout. Fragments run against a scope that survives for the
//! life of the process, and can call back into the parent with `llm_query`.

mod stdio;

use std::rc::Rc;

use clap::builder::TypedValueParser;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use rlm_eval::{
    Channel, ExecMode, Exit, InterpreterOptions, QueryBridge, Session, DEFAULT_CHUNK_NAME,
    DEFAULT_TOKEN_LEN,
};

/// Default suspension handling for `exec` records that do not declare one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Suspend only fragments that use `await` or `gather`.
    Auto,
    /// Always run fragments directly.
    Direct,
    /// Always run fragments as coroutines.
    Suspendable,
}

impl From<Mode> for ExecMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Auto => ExecMode::Auto,
            Mode::Direct => ExecMode::Direct,
            Mode::Suspendable => ExecMode::Suspendable,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rlm-repl")]
#[command(about = "Persistent Lua REPL worker speaking line-delimited JSON on stdio")]
#[command(version)]
struct Args {
    /// Suspension mode for fragments that do not declare one
    #[arg(long, value_enum, default_value_t = Mode::Auto)]
    mode: Mode,

    /// Name fragments carry in error messages
    #[arg(long, value_name = "NAME", default_value = DEFAULT_CHUNK_NAME)]
    chunk_name: String,

    /// Number of hex digits in query tokens
    #[arg(
        long,
        value_name = "N",
        default_value_t = DEFAULT_TOKEN_LEN,
        value_parser = clap::value_parser!(u8).range(8..=32).map(usize::from)
    )]
    token_len: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, value_name = "FILTER", default_value = "info")]
    log_level: String,

    /// Initial value of the `context` global
    #[arg(long, value_name = "TEXT")]
    context: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(mode = ?args.mode, token_len = args.token_len, "starting RLM REPL worker");

    let endpoints = stdio::capture()?;
    let channel = Rc::new(Channel::new(endpoints.reader, endpoints.writer));
    let bridge = Rc::new(QueryBridge::with_token_len(Rc::clone(&channel), args.token_len));
    let options = InterpreterOptions {
        chunk_name: args.chunk_name,
        default_mode: args.mode.into(),
    };

    let mut session = Session::new(channel, bridge, options)?;
    if let Some(context) = &args.context {
        session.interpreter().set_context(context)?;
    }

    match session.serve()? {
        Exit::Shutdown => tracing::info!("stopped on shutdown"),
        Exit::EndOfInput => tracing::info!("stopped at end of input"),
    }
    Ok(())
}
