//! Allocation-free diagnostics on stderr.
//!
//! Anything that runs inside an interposed `malloc` must not allocate, so
//! lines are formatted into a fixed stack buffer and emitted with a single
//! `write(2)`. Long lines are truncated rather than split.

use crate::platform;
use core::fmt;

const PREFIX: &str = "ksm_preload: ";
const LINE_CAPACITY: usize = 256;

/// A single diagnostic line, built on the stack.
pub struct Line {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl Line {
    pub const fn new() -> Self {
        Line {
            buf: [0u8; LINE_CAPACITY],
            len: 0,
        }
    }

    /// Format `args` behind the crate prefix and terminate with a newline.
    pub fn render(args: fmt::Arguments<'_>) -> Self {
        let mut line = Line::new();
        let _ = fmt::Write::write_str(&mut line, PREFIX);
        let _ = fmt::Write::write_fmt(&mut line, args);
        line.finish();
        line
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn finish(&mut self) {
        if self.len == LINE_CAPACITY {
            self.len -= 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
    }
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

/// Write one formatted line to stderr.
#[cold]
pub fn emit(args: fmt::Arguments<'_>) {
    platform::write_stderr(Line::render(args).as_bytes());
}

/// Write one formatted line to stderr and abort the process.
#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    emit(args);
    platform::abort()
}

/// Per-call trace line. Compiled out unless the `debug` feature is enabled.
macro_rules! trace {
    ($($arg:tt)*) => {
        if cfg!(feature = "debug") {
            $crate::diag::emit(format_args!($($arg)*));
        }
    };
}

/// Diagnostic that is always emitted. Reserved for one-off startup problems.
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::diag::emit(format_args!($($arg)*))
    };
}
