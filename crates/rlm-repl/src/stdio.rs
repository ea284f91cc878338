//! Protocol endpoints taken from the process's standard streams.
//!
//! On Unix the descriptors behind stdin and stdout are duplicated for the
//! channel's exclusive use, and fds 0 and 1 are then pointed elsewhere
//! (`/dev/null` and stderr). Anything that later writes to "standard output"
//! from native code, including the Lua `io` library's own handles, lands on
//! stderr instead of inside the protocol stream.

use std::io::{self, BufRead, BufReader, Write};

/// The endpoints a [`rlm_eval::Channel`] is built from.
pub struct Endpoints {
    pub reader: Box<dyn BufRead>,
    pub writer: Box<dyn Write>,
}

#[cfg(unix)]
pub fn capture() -> io::Result<Endpoints> {
    use std::fs::File;
    use std::os::fd::{AsFd, AsRawFd};

    let reader = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    let writer = File::from(io::stdout().as_fd().try_clone_to_owned()?);

    let null = File::open("/dev/null")?;
    rebind(null.as_raw_fd(), libc::STDIN_FILENO)?;
    rebind(libc::STDERR_FILENO, libc::STDOUT_FILENO)?;

    Ok(Endpoints {
        reader: Box::new(BufReader::new(reader)),
        writer: Box::new(io::LineWriter::new(writer)),
    })
}

#[cfg(not(unix))]
pub fn capture() -> io::Result<Endpoints> {
    Ok(Endpoints {
        reader: Box::new(io::stdin().lock()),
        writer: Box::new(io::stdout()),
    })
}

#[cfg(unix)]
fn rebind(from: libc::c_int, to: libc::c_int) -> io::Result<()> {
    // SAFETY: both descriptors are open; dup2 only replaces `to`, whose
    // previous target has already been duplicated for the channel.
    let rc = unsafe { libc::dup2(from, to) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
