//! # Kernel Log Buffer
//!
//! The kernel logs through the `log` facade. [`RingLogger`] is a `log::Log`
//! sink for targets without a console: it keeps the most recent lines in a
//! fixed ring that a debugger or a low-priority task can drain.

use core::cell::RefCell;
use core::fmt::Write;

use critical_section::Mutex;
use heapless::{Deque, String};
use log::{LevelFilter, Metadata, Record};

/// Longest kept line; longer messages are truncated.
pub const LINE_LEN: usize = 96;
/// Lines kept before the oldest is dropped.
pub const LINES: usize = 32;

pub type LogLine = String<LINE_LEN>;

pub struct RingLogger {
    lines: Mutex<RefCell<Deque<LogLine, LINES>>>,
}

impl RingLogger {
    pub const fn new() -> Self {
        Self {
            lines: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Remove every buffered line, oldest first, passing each to `f`.
    pub fn drain(&self, mut f: impl FnMut(&str)) {
        while let Some(line) = critical_section::with(|cs| self.lines.borrow_ref_mut(cs).pop_front()) {
            f(&line);
        }
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.lines.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RingLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LogLine::new();
        // a full line is simply cut short
        let _ = write!(line, "{} {}: {}", record.level(), record.target(), record.args());
        critical_section::with(|cs| {
            let mut lines = self.lines.borrow_ref_mut(cs);
            if lines.is_full() {
                lines.pop_front();
            }
            let _ = lines.push_back(line);
        });
    }

    fn flush(&self) {}
}

static LOGGER: RingLogger = RingLogger::new();

/// Install the ring logger as the global logger. A second call keeps the
/// first logger and only changes the level.
pub fn init(level: LevelFilter) {
    log::set_max_level(level);
    let _ = log::set_logger(&LOGGER);
}

/// Drain the global ring logger.
pub fn drain(f: impl FnMut(&str)) {
    LOGGER.drain(f)
}
