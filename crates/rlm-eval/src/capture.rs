//! Ambient output streams seen by fragments, and scoped redirection of them.
//!
//! `print`, `io.write` and the `io.stdout`/`io.stderr` handles installed by
//! the prelude all write through [`Streams`]. A [`Redirect`] pushes a fresh
//! pair of buffers for the length of one run and, however the run ends, pops
//! them again and puts back the Lua-level stream bindings it found.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Lua, Table, Value};

/// Which ambient stream a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Buffers {
    stdout: String,
    stderr: String,
}

/// Stack of active capture buffers. Writes go to the innermost one.
#[derive(Debug, Default)]
pub struct Streams {
    stack: RefCell<Vec<Buffers>>,
}

impl Streams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, stream: Stream, text: &str) {
        let mut stack = self.stack.borrow_mut();
        match stack.last_mut() {
            Some(buffers) => match stream {
                Stream::Stdout => buffers.stdout.push_str(text),
                Stream::Stderr => buffers.stderr.push_str(text),
            },
            None => {
                tracing::debug!(?stream, text, "fragment output with no active capture");
            }
        }
    }

    /// Number of nested captures currently active.
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    fn push(&self) {
        self.stack.borrow_mut().push(Buffers::default());
    }

    fn pop(&self) -> Buffers {
        self.stack.borrow_mut().pop().unwrap_or_default()
    }
}

/// The Lua-level stream bindings in effect when a redirect began.
struct Bindings {
    print: Value,
    io: Value,
    io_fields: Vec<(&'static str, Value)>,
}

impl Bindings {
    /// Members of the `io` table that route output.
    const IO_FIELDS: [&'static str; 4] = ["write", "output", "stdout", "stderr"];

    fn snapshot(globals: &Table) -> mlua::Result<Self> {
        let print: Value = globals.raw_get("print")?;
        let io: Value = globals.raw_get("io")?;
        let mut io_fields = Vec::with_capacity(Self::IO_FIELDS.len());
        if let Value::Table(table) = &io {
            for name in Self::IO_FIELDS {
                let value: Value = table.raw_get(name)?;
                io_fields.push((name, value));
            }
        }
        Ok(Self {
            print,
            io,
            io_fields,
        })
    }

    fn restore(&self, globals: &Table) -> mlua::Result<()> {
        globals.raw_set("print", self.print.clone())?;
        globals.raw_set("io", self.io.clone())?;
        if let Value::Table(table) = &self.io {
            for (name, value) in &self.io_fields {
                table.raw_set(*name, value.clone())?;
            }
        }
        Ok(())
    }
}

/// Scoped capture of one run's output.
///
/// Dropping the guard without calling [`Redirect::finish`] still restores
/// everything; the captured text is then discarded.
pub struct Redirect {
    streams: Rc<Streams>,
    globals: Table,
    saved: Option<Bindings>,
    active: bool,
}

impl Redirect {
    pub fn begin(streams: Rc<Streams>, lua: &Lua) -> Self {
        let globals = lua.globals();
        let saved = match Bindings::snapshot(&globals) {
            Ok(bindings) => Some(bindings),
            Err(err) => {
                tracing::warn!(error = %err, "could not snapshot stream bindings");
                None
            }
        };
        streams.push();
        tracing::trace!(depth = streams.depth(), "capture started");
        Self {
            streams,
            globals,
            saved,
            active: true,
        }
    }

    /// Write into this capture directly, bypassing Lua.
    pub fn write(&self, stream: Stream, text: &str) {
        self.streams.write(stream, text);
    }

    /// End the capture and return `(stdout, stderr)`.
    pub fn finish(mut self) -> (String, String) {
        let buffers = self.end();
        (buffers.stdout, buffers.stderr)
    }

    fn end(&mut self) -> Buffers {
        self.active = false;
        if let Some(saved) = &self.saved {
            if let Err(err) = saved.restore(&self.globals) {
                tracing::warn!(error = %err, "could not restore stream bindings");
            }
        }
        self.streams.pop()
    }
}

impl Drop for Redirect {
    fn drop(&mut self) {
        if self.active {
            self.end();
        }
    }
}
