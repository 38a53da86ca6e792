/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Shared helpers for unit tests */
#![cfg(test)]

use crate::protocol::*;
use nix::fcntl;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket;
use nix::unistd;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

struct TestLogger {
    max_level: log::LevelFilter,
    color_output: bool,
}

impl log::Log for TestLogger {
    fn enabled(&self, meta: &log::Metadata<'_>) -> bool {
        meta.level() <= self.max_level
    }
    fn log(&self, record: &log::Record<'_>) {
        if record.level() > self.max_level {
            return;
        }

        let time = SystemTime::now().duration_since(std::time::UNIX_EPOCH);
        let t = if let Ok(t) = time {
            (t.as_nanos() % 100000000000u128) / 1000u128
        } else {
            0
        };
        let b = std::thread::current();
        let thread_name = b.name().unwrap_or("");
        let (esc1a, esc1b, esc1c) = if self.color_output {
            let c = if thread_name.starts_with("vkcapture") {
                "36"
            } else {
                "35"
            };
            if record.level() <= log::Level::Error {
                ("\x1b[0;", c, ";1m")
            } else {
                ("\x1b[0;", c, "m")
            }
        } else {
            ("", "", "")
        };
        let esc2 = if self.color_output { "\x1b[0m" } else { "" };
        let lvl_str: &str = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "Wrn",
            log::Level::Debug => "dbg",
            log::Level::Info => "inf",
            log::Level::Trace => "trc",
        };
        let file = record.file().unwrap_or("src/unknown");
        /* println! so that the harness captures output of passing tests */
        println!(
            "{}{}{}[{:02}.{:06} {}({}) {}:{}]{} {}",
            esc1a,
            esc1b,
            esc1c,
            t / 1000000u128,
            t % 1000000u128,
            lvl_str,
            thread_name,
            file.strip_prefix("src/").unwrap_or(file),
            record.line().unwrap_or(0),
            esc2,
            record.args(),
        );
    }
    fn flush(&self) {
        /* not needed */
    }
}

/** Route log output through the test harness; later calls do nothing */
pub fn setup_test_logger() {
    let max_level = log::LevelFilter::Debug;
    let logger = TestLogger {
        max_level,
        color_output: unistd::isatty(2).unwrap_or(false),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(max_level);
    }
}

/** Connected nonblocking stream sockets */
pub fn socket_pair() -> (OwnedFd, OwnedFd) {
    socket::socketpair(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        None,
        socket::SockFlag::SOCK_NONBLOCK | socket::SockFlag::SOCK_CLOEXEC,
    )
    .unwrap()
}

/** A nonblocking pipe, as (read end, write end) */
pub fn nonblocking_pipe() -> (OwnedFd, OwnedFd) {
    unistd::pipe2(fcntl::OFlag::O_CLOEXEC | fcntl::OFlag::O_NONBLOCK).unwrap()
}

/** Return true iff every copy of the pipe's write end has been closed */
pub fn pipe_writers_closed(read_end: &OwnedFd) -> bool {
    let mut buf = [0u8; 1];
    match unistd::read(std::os::fd::AsRawFd::as_raw_fd(read_end), &mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(nix::errno::Errno::EAGAIN) => false,
        Err(e) => panic!("pipe read failed: {}", e),
    }
}

/** An abstract socket name no other test (or process) uses */
pub fn unique_socket_name(label: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/com/obsproject/vkcapture-test/{}/{}/{}",
        std::process::id(),
        label,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/** Wait up to 5 seconds for a CLIENT or TEXTURE record */
pub fn recv_record_blocking(sock: &OwnedFd) -> ClientRecord {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(r) = recv_client_record(sock).unwrap() {
            return r;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        assert!(!left.is_zero(), "timed out waiting for record");
        let mut pfd = [PollFd::new(sock.as_fd(), PollFlags::POLLIN)];
        let ms = PollTimeout::from(left.as_millis().min(1000) as u16);
        let _ = nix::poll::poll(&mut pfd, ms);
    }
}

/** Poll `cond` every few milliseconds until it holds; false on timeout */
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/** Serializes tests that create Vulkan instances */
pub static VULKAN_LOCK: Mutex<()> = Mutex::new(());

/** Return true iff a render node exists, so that Vulkan tests can run */
pub fn has_render_node() -> bool {
    let Ok(dir) = std::fs::read_dir("/dev/dri") else {
        return false;
    };
    dir.filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("renderD"))
}
