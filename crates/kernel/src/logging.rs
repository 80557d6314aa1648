//! Kernel logging.
//!
//! Log lines carry a boot-time stamp and a colored level tag. Output goes
//! to a byte sink the embedder registers at boot (usually a serial port)
//! and is always mirrored into an in-kernel ring buffer so the log stays
//! readable from the debug console even with no working sink.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::utils::locks::SpinLock;

/// Bytes kept in the in-kernel log ring.
pub const KLOG_SIZE: usize = 16 * 1024;

pub type LogSink = fn(&str);

static SINK: SpinLock<Option<LogSink>> = SpinLock::new(None);
static KLOG: SpinLock<LogRing> = SpinLock::new(LogRing::new());

/// When set, log lines are echoed through the debug console path as well.
pub static DEBUG_CONSOLE: AtomicBool = AtomicBool::new(false);

/// Registers the byte sink log lines are pushed to.
pub fn set_sink(sink: LogSink) {
    *SINK.lock() = Some(sink);
}

/// Switches the console over to the in-kernel debug log
/// (the `debug_enable_console` syscall ends up here).
pub fn enable_debug_console() {
    DEBUG_CONSOLE.store(true, Ordering::Relaxed);
}

/// Fixed-size overwrite-oldest ring of log bytes.
pub struct LogRing {
    buf: [u8; KLOG_SIZE],
    head: usize,
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            buf: [0; KLOG_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.buf[(self.head + self.len) % KLOG_SIZE] = b;
            if self.len < KLOG_SIZE {
                self.len += 1;
            } else {
                self.head = (self.head + 1) % KLOG_SIZE;
            }
        }
    }

    /// Copies the buffered log into `out`, oldest byte first.
    /// Returns the number of bytes written.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        let skip = self.len - n;
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.buf[(self.head + skip + i) % KLOG_SIZE];
        }
        n
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Write for LogRing {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

/// Reads back up to `out.len()` bytes of the kernel log.
pub fn klog_read(out: &mut [u8]) -> usize {
    KLOG.lock().read(out)
}

#[doc(hidden)]
pub fn _log(args: fmt::Arguments) {
    // the ring never fails; a missing sink just drops the line
    let _ = KLOG.lock().write_fmt(args);
    if let Some(sink) = *SINK.lock() {
        struct SinkWriter(LogSink);
        impl Write for SinkWriter {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                (self.0)(s);
                Ok(())
            }
        }
        let _ = SinkWriter(sink).write_fmt(args);
    }
}

pub(crate) fn log_time_from_us(us: u64) -> (u32, u8, u8, u16) {
    let ms = us / 1000;
    let into_seconds = || (ms / 1000, ms % 1000);
    let into_minutes = || {
        let (seconds, ms) = into_seconds();
        (seconds / 60, seconds % 60, ms)
    };
    let into_hours = || {
        let (minutes, seconds, ms) = into_minutes();
        (minutes / 60, minutes % 60, seconds, ms)
    };

    match ms {
        ..1000 => (0, 0, 0, ms as u16),
        1000..60000 => {
            let (seconds, ms) = into_seconds();
            (0, 0, seconds as u8, ms as u16)
        }
        60000..3_600_000 => {
            let (minutes, seconds, ms) = into_minutes();
            (0, minutes as u8, seconds as u8, ms as u16)
        }
        _ => {
            let (hours, minutes, seconds, ms) = into_hours();
            (hours as u32, minutes as u8, seconds as u8, ms as u16)
        }
    }
}

pub const MIN_LOG_TYPE_NAME_WIDTH: usize = 5;

#[macro_export]
macro_rules! logln {
    ($($arg:tt)*) => {{
        let (hours, minutes, seconds, ms) =
            $crate::logging::log_time_from_us($crate::clock::boot_time_us());
        $crate::logging::_log(format_args!(
            "[{hours:02}:{minutes:02}:{seconds:02}.{ms:03}] {}\n",
            format_args!($($arg)*)
        ));
    }};
}

#[macro_export]
macro_rules! logln_ext {
    ($name: literal, $name_color: literal, as $kind: expr, $($arg:tt)*) => {
        $crate::logln!("[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m {kind}:\x1B[0m {}", format_args!($($arg)*), name_color = $name_color, name = $name, kind = $kind, width = $crate::logging::MIN_LOG_TYPE_NAME_WIDTH)
    };

    ($name: literal, $name_color: literal, $($arg:tt)*) => {
        $crate::logln!("[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m:\x1B[0m {}", format_args!($($arg)*), name_color = $name_color, name = $name, width = $crate::logging::MIN_LOG_TYPE_NAME_WIDTH)
    };
}

/// runtime debug info
/// takes a $mod and an Arguments, mod must be a type
#[macro_export]
macro_rules! debug {
    ($mod: ty, $($arg:tt)*) => {{
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("debug", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => {{
        $crate::logln_ext!("debug", 91, $($arg)*)
    }};
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::logln_ext!("info", 92, $($arg)*));
}

#[macro_export]
macro_rules! warn {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("warn", 93, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("warn", 93, $($arg)*));
}

#[macro_export]
macro_rules! error {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("error", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("error", 91, $($arg)*));
}

#[cfg(test)]
mod tests {
    use super::LogRing;
    use core::fmt::Write;

    #[test]
    fn ring_keeps_newest_bytes() {
        let mut ring = LogRing::new();
        ring.write_str("hello ").unwrap();
        ring.write_str("world").unwrap();

        let mut out = [0u8; 32];
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], b"hello world");
    }

    #[test]
    fn ring_overwrites_oldest_on_wrap() {
        let mut ring = LogRing::new();
        for _ in 0..super::KLOG_SIZE {
            ring.push(b"a");
        }
        ring.push(b"zz");

        assert_eq!(ring.len(), super::KLOG_SIZE);
        let mut out = alloc::vec![0u8; super::KLOG_SIZE];
        let n = ring.read(&mut out);
        assert_eq!(n, super::KLOG_SIZE);
        assert_eq!(&out[n - 2..n], b"zz");
        assert_eq!(out[0], b'a');
    }

    #[test]
    fn time_stamp_decomposition() {
        assert_eq!(super::log_time_from_us(0), (0, 0, 0, 0));
        assert_eq!(super::log_time_from_us(999_000), (0, 0, 0, 999));
        assert_eq!(super::log_time_from_us(61_500_000), (0, 1, 1, 500));
        assert_eq!(
            super::log_time_from_us(3_600_000_000 + 1_000),
            (1, 0, 0, 1)
        );
    }
}
