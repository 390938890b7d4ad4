//! Monitor logging
//!
//! Lock-free ring-buffer logger usable from any context the monitor runs
//! in. The buffer lives at a fixed address so an external debugger or the
//! host console driver can drain it without calling back into the monitor;
//! writers never block and old data is overwritten when the buffer wraps.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const LOG_BUF_SIZE: usize = 32 * 1024;

static LOG_BUFFER: [AtomicU8; LOG_BUF_SIZE] = [const { AtomicU8::new(0) }; LOG_BUF_SIZE];
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

/// Writer implementing `core::fmt::Write` on top of the ring.
pub struct RingWriter;

impl Write for RingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
            LOG_BUFFER[pos].store(b, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Formatted logging into the ring buffer; accepts `format!` syntax.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = core::fmt::write(&mut $crate::log::RingWriter, format_args!($($arg)*));
        let _ = $crate::log::RingWriter.write_str("\n");
    }};
}

/// Ring contents for external drainers. Bytes may be torn mid-record; the
/// reader is expected to resynchronize on newlines.
pub fn buffer() -> &'static [AtomicU8; LOG_BUF_SIZE] {
    &LOG_BUFFER
}

/// Bytes written since start, monotonically increasing across wraps.
pub fn cursor() -> usize {
    WRITE_POS.load(Ordering::Relaxed)
}
