//! Line-delimited message channel to the parent controller.
//!
//! The channel owns the two endpoints it was built with and never looks at
//! the process's standard streams again, so whatever a fragment does with its
//! own output cannot reach protocol traffic.

use std::cell::{Cell, RefCell};
use std::io::{self, BufRead, Write};

use crate::protocol::{Inbound, Outbound};

/// One inbound and one outbound endpoint, fixed for the process lifetime.
pub struct Channel {
    reader: RefCell<Box<dyn BufRead>>,
    writer: RefCell<Box<dyn Write>>,
    closed: Cell<bool>,
}

impl Channel {
    pub fn new(reader: impl BufRead + 'static, writer: impl Write + 'static) -> Self {
        Self {
            reader: RefCell::new(Box::new(reader)),
            writer: RefCell::new(Box::new(writer)),
            closed: Cell::new(false),
        }
    }

    /// Serialize `record` onto a single line and flush it.
    pub fn send(&self, record: &Outbound) -> crate::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.borrow_mut();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    /// Read the next well-formed record.
    ///
    /// Blank lines and lines that do not parse as a record are skipped.
    /// Returns `Ok(None)` once the inbound side reaches end-of-stream.
    pub fn recv(&self) -> io::Result<Option<Inbound>> {
        if self.closed.get() {
            return Ok(None);
        }

        let mut reader = self.reader.borrow_mut();
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                self.closed.set(true);
                return Ok(None);
            }

            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Inbound>(trimmed) {
                Ok(record) => return Ok(Some(record)),
                Err(err) => {
                    tracing::trace!(error = %err, "dropping malformed inbound line");
                }
            }
        }
    }

    /// Whether the inbound side has reached end-of-stream.
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}
