//! The dispatch loop: read a control record, act on it, answer.

use std::rc::Rc;

use crate::bridge::QueryBridge;
use crate::channel::Channel;
use crate::interpreter::{Interpreter, InterpreterOptions};
use crate::protocol::{Inbound, Outbound};

/// Why [`Session::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The parent sent `shutdown`.
    Shutdown,
    /// The inbound endpoint reached end-of-stream.
    EndOfInput,
}

/// One parent connection driving one interpreter.
pub struct Session {
    channel: Rc<Channel>,
    bridge: Rc<QueryBridge>,
    interpreter: Interpreter,
}

impl Session {
    /// Build a session whose interpreter queries through `bridge`.
    ///
    /// `bridge` must have been built on the same `channel`.
    pub fn new(
        channel: Rc<Channel>,
        bridge: Rc<QueryBridge>,
        options: InterpreterOptions,
    ) -> crate::Result<Self> {
        let interpreter = Interpreter::with_options(Rc::clone(&bridge), options)?;
        Ok(Self {
            channel,
            bridge,
            interpreter,
        })
    }

    /// Build a session with random query tokens and default options.
    pub fn with_defaults(channel: Rc<Channel>) -> crate::Result<Self> {
        let bridge = Rc::new(QueryBridge::new(Rc::clone(&channel)));
        Self::new(channel, bridge, InterpreterOptions::default())
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    /// Announce readiness, then handle control records until told to stop.
    ///
    /// Only endpoint I/O failures are returned as errors; everything a
    /// fragment does is reported through `exec_done`.
    pub fn serve(&mut self) -> crate::Result<Exit> {
        self.channel.send(&Outbound::Ready)?;
        tracing::info!("session ready");

        loop {
            let Some(record) = self.channel.recv()? else {
                tracing::info!("inbound channel closed, stopping");
                return Ok(Exit::EndOfInput);
            };
            tracing::debug!(kind = record.kind(), "dispatching");

            match record {
                Inbound::Exec { code, suspend } => {
                    let done = self.interpreter.run(&code, suspend);
                    self.channel.send(&Outbound::ExecDone(done))?;
                    // A query inside the run may have hit end-of-stream.
                    if self.channel.is_closed() {
                        tracing::info!("inbound channel closed during run, stopping");
                        return Ok(Exit::EndOfInput);
                    }
                }
                Inbound::SetContext { value } => {
                    if let Err(err) = self.interpreter.set_context(&value) {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        tracing::warn!(error = %err, "could not set context");
                    }
                    self.channel.send(&Outbound::ContextSet)?;
                }
                Inbound::ResetFinal => {
                    self.interpreter.reset_final();
                    self.channel.send(&Outbound::FinalReset)?;
                }
                Inbound::Shutdown => {
                    tracing::info!("shutdown requested");
                    return Ok(Exit::Shutdown);
                }
                // Answers for handles a fragment kept in a global
                // arrive between runs.
                Inbound::LlmResult { id, result } => {
                    self.bridge.deliver(id, result);
                }
                Inbound::Unknown => {
                    tracing::trace!("ignoring unrecognized record");
                }
            }
        }
    }
}
