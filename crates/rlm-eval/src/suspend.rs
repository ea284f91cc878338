//! Static check for fragments that need suspendable execution.
//!
//! A fragment needs to run as a coroutine when it names one of the pause
//! points. The scan is lexical: names inside strings and comments, and names
//! used as fields (`t.await`, `obj:gather()`), do not count.

/// Globals that can suspend the running fragment.
pub const PAUSE_POINTS: &[&str] = &["await", "gather"];

/// How a fragment should be executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecMode {
    /// Decide from the fragment's text.
    #[default]
    Auto,
    /// Plain synchronous execution.
    Direct,
    /// Run as a coroutine on a fresh scheduler.
    Suspendable,
}

impl ExecMode {
    /// Map an explicit `suspend` flag onto a mode, falling back to `self`.
    pub fn with_declaration(self, suspend: Option<bool>) -> Self {
        match suspend {
            Some(true) => ExecMode::Suspendable,
            Some(false) => ExecMode::Direct,
            None => self,
        }
    }

    /// Resolve `Auto` against the fragment text.
    pub fn resolve(self, code: &str) -> Self {
        match self {
            ExecMode::Auto if needs_suspension(code) => ExecMode::Suspendable,
            ExecMode::Auto => ExecMode::Direct,
            explicit => explicit,
        }
    }
}

/// Whether `code` refers to any of the [`PAUSE_POINTS`] as a global.
pub fn needs_suspension(code: &str) -> bool {
    let bytes = code.as_bytes();
    let len = bytes.len();
    let mut i = 0;
    let mut after_member = false;

    while i < len {
        let b = bytes[i];
        match b {
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i += 2;
                match long_bracket_level(bytes, i) {
                    Some(level) => i = skip_long_bracket(bytes, i, level),
                    None => {
                        while i < len && bytes[i] != b'\n' {
                            i += 1;
                        }
                    }
                }
            }
            b'"' | b'\'' => {
                i = skip_quoted(bytes, i);
                after_member = false;
            }
            b'[' => {
                i = match long_bracket_level(bytes, i) {
                    Some(level) => skip_long_bracket(bytes, i, level),
                    None => i + 1,
                };
                after_member = false;
            }
            b'.' | b':' => {
                let doubled = bytes.get(i + 1) == Some(&b);
                let number = b == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit);
                if doubled || number {
                    // `..`, `...`, `::label::`, `.5`
                    i += 1;
                    while bytes.get(i) == Some(&b) {
                        i += 1;
                    }
                    after_member = false;
                } else {
                    i += 1;
                    after_member = true;
                }
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &code[start..i];
                if !after_member && PAUSE_POINTS.contains(&word) {
                    return true;
                }
                after_member = false;
            }
            b if b.is_ascii_digit() => {
                while i < len && is_numeral_byte(bytes[i]) {
                    i += 1;
                }
                after_member = false;
            }
            b if b.is_ascii_whitespace() => i += 1,
            _ => {
                i += 1;
                after_member = false;
            }
        }
    }
    false
}

/// Bytes that can continue a numeral, hex digits and exponents included.
fn is_numeral_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'_'
}

/// If a long bracket (`[[`, `[==[`) opens at `i`, its level.
fn long_bracket_level(bytes: &[u8], i: usize) -> Option<usize> {
    if bytes.get(i) != Some(&b'[') {
        return None;
    }
    let mut j = i + 1;
    while bytes.get(j) == Some(&b'=') {
        j += 1;
    }
    (bytes.get(j) == Some(&b'[')).then_some(j - i - 1)
}

/// Index just past the long bracket opened at `i`, or the end of input.
fn skip_long_bracket(bytes: &[u8], i: usize, level: usize) -> usize {
    let mut j = i + level + 2;
    while j < bytes.len() {
        if bytes[j] == b']' {
            let mut k = j + 1;
            while k < bytes.len() && bytes[k] == b'=' {
                k += 1;
            }
            if k - j - 1 == level && bytes.get(k) == Some(&b']') {
                return k + 1;
            }
        }
        j += 1;
    }
    bytes.len()
}

/// Index just past the quoted string starting at `i`.
fn skip_quoted(bytes: &[u8], i: usize) -> usize {
    let quote = bytes[i];
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'\n' => return j,
            c if c == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}
