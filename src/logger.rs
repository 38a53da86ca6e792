/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Line-oriented stderr logger shared by the server binary and the injected libraries */
use log::{Log, Record};
use std::io::Write;

/** Logger configuration data */
pub struct Logger {
    max_level: log::LevelFilter,
    pid: u32,
    color_output: bool,
    label: &'static str,
}

const MAX_LOG_LEN: usize = 512;

impl Logger {
    pub fn new(label: &'static str, max_level: log::LevelFilter) -> Logger {
        Logger {
            max_level,
            pid: std::process::id(),
            color_output: nix::unistd::isatty(2).unwrap_or(false),
            label,
        }
    }

    /** Format a record into `buf`, returning the number of bytes used */
    fn format_line(&self, record: &Record<'_>, buf: &mut [u8; MAX_LOG_LEN]) -> usize {
        let time = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH);
        let t = if let Ok(t) = time {
            (t.as_nanos() % 100000000000u128) / 1000u128
        } else {
            0
        };
        let (esc1a, esc1c) = if self.color_output {
            if record.level() <= log::Level::Error {
                ("\x1b[0;35", ";1m")
            } else {
                ("\x1b[0;35", "m")
            }
        } else {
            ("", "")
        };
        let esc2 = if self.color_output { "\x1b[0m" } else { "" };
        let lvl_str: &str = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "Wrn",
            log::Level::Debug => "dbg",
            log::Level::Info => "inf",
            log::Level::Trace => "trc",
        };

        let mut cursor = std::io::Cursor::new(&mut buf[..MAX_LOG_LEN - 4]);
        let file = record.file().unwrap_or("src/unknown");
        let _ = write!(
            &mut cursor,
            "{}{}[{:02}.{:06} {} {}({}) {}:{}]{} {}\n",
            esc1a,
            esc1c,
            t / 1000000u128,
            t % 1000000u128,
            lvl_str,
            self.label,
            self.pid,
            file.strip_prefix("src/").unwrap_or(file),
            record.line().unwrap_or(0),
            esc2,
            record.args(),
        );
        let mut str_end = cursor.position() as usize;
        if str_end >= MAX_LOG_LEN - 8 {
            /* Deal with possible partial UTF-8 char */
            str_end = match std::str::from_utf8(&buf[..str_end]) {
                Ok(x) => x.len(),
                Err(y) => y.valid_up_to(),
            };
        }
        if str_end >= MAX_LOG_LEN - 8 {
            /* Assume message was truncated */
            str_end = str_end.min(MAX_LOG_LEN - 4);
            buf[str_end..str_end + 3].fill(b'.');
            buf[str_end + 3] = b'\n';
            str_end += 4;
        }
        str_end
    }
}

impl Log for Logger {
    fn enabled(&self, meta: &log::Metadata<'_>) -> bool {
        meta.level() <= self.max_level
    }
    fn log(&self, record: &Record<'_>) {
        if record.level() > self.max_level {
            return;
        }
        let mut buf = [0u8; MAX_LOG_LEN];
        let len = self.format_line(record, &mut buf);
        let handle = &mut std::io::stderr().lock();
        let _ = handle.write_all(&buf[..len]);
        let _ = handle.flush();
    }
    fn flush(&self) {
        /* not needed */
    }
}

/** Install the logger as the global `log` sink.
 *
 * Later calls are ignored, since both injected libraries may try. */
pub fn init(label: &'static str, max_level: log::LevelFilter) {
    if log::set_boxed_logger(Box::new(Logger::new(label, max_level))).is_ok() {
        log::set_max_level(max_level);
    }
}
