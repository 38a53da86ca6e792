/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Misc utilities and types */
use nix::errno::Errno;
use nix::{libc, unistd};
use std::ffi::c_void;
use std::fmt::{Display, Formatter};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Mutex, MutexGuard, PoisonError};

/** Like `format!`, but prepends file and line number.
 *
 * Example: `tag!("Failed to X: {} {}", arg1, arg2)` */
#[macro_export]
macro_rules! tag {
    ($x:tt) => {
        format!(concat!(std::file!(), ":", std::line!(), ": ", $x))
    };
    ($x:tt, $($arg:tt)+) => {
        format!(concat!(std::file!(), ":", std::line!(), ": ", $x), $($arg)+)
    };
}

/** A type to escape all non-ascii-printable characters when Displayed, to leave strings
 * somewhat legible but make it clear exactly what bytes they contain */
pub struct EscapeAsciiPrintable<'a>(pub &'a [u8]);
impl Display for EscapeAsciiPrintable<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0 {
            match *c {
                b' '..=b'~' => write!(f, "{}", *c as char),
                _ => {
                    write!(f, "\\x{:02x}", *c)
                }
            }?
        }
        Ok(())
    }
}

/** Format a bool as 'T' or 'F' */
pub fn fmt_bool(x: bool) -> char {
    if x {
        'T'
    } else {
        'f'
    }
}

/** Lock a mutex, recovering the data if another thread panicked while holding it.
 *
 * Code running inside a hooked application must keep going even then. */
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/** Interpret an environment variable value as a boolean flag */
pub fn parse_env_flag(value: &str) -> bool {
    let v = value.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

/** Return true iff the environment variable is set to a true value */
pub fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|x| parse_env_flag(&x)).unwrap_or(false)
}

/** Create a nonblocking, close-on-exec eventfd */
pub fn make_evt_fd() -> Result<OwnedFd, String> {
    unsafe {
        let ev_flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let ev_fd: i32 = libc::eventfd(0, ev_flags);
        if ev_fd == -1 {
            return Err(tag!("Failed to create eventfd: {}", Errno::last()));
        }
        // SAFETY: ev_fd only captured here and was checked valid
        Ok(OwnedFd::from_raw_fd(ev_fd))
    }
}

/** Increment an eventfd to wake up the thread that `poll()`s it */
pub fn wakeup_fd(fd: &OwnedFd) -> Result<(), String> {
    let one = 1u64.to_ne_bytes();
    loop {
        match unistd::write(fd, &one) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                /* counter saturated, the poller will wake up anyway */
                return Ok(());
            }
            Err(e) => return Err(tag!("Failed to write to eventfd: {}", e)),
        }
    }
}

/** Reset an eventfd counter to zero */
pub fn drain_evt_fd(fd: &OwnedFd) -> Result<(), String> {
    let mut buf = [0u8; 8];
    loop {
        match unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(()),
            Err(e) => return Err(tag!("Failed to read from eventfd: {}", e)),
        }
    }
}

/* Requirements: for the specific ioctl used, arg must be properly
 * aligned, have the right type, and have the correct lifespan */
pub unsafe fn ioctl_loop(
    fd: &OwnedFd,
    code: u32,
    arg: *mut c_void,
    about: &str,
) -> Result<(), String> {
    let req = code as libc::c_ulong;
    loop {
        let ret = libc::ioctl(fd.as_raw_fd(), req, arg);
        let errno = Errno::last_raw();
        if ret == 0 {
            return Ok(());
        } else if (errno == Errno::EINTR as i32) || (errno == Errno::EAGAIN as i32) {
            continue;
        } else {
            return Err(tag!("ioctl {:x} ({}) failed: {}", code, about, errno));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flag_values() {
        for v in ["1", "true", "TRUE", "yes", "On", " 1 "] {
            assert!(parse_env_flag(v), "{}", v);
        }
        for v in ["", "0", "false", "no", "off", "2", "y"] {
            assert!(!parse_env_flag(v), "{}", v);
        }
    }

    #[test]
    fn evt_fd_wakeup_and_drain() {
        use nix::poll::{PollFd, PollFlags, PollTimeout};
        use std::os::fd::AsFd;

        let fd = make_evt_fd().unwrap();
        let mut pfd = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        assert_eq!(nix::poll::poll(&mut pfd, PollTimeout::ZERO).unwrap(), 0);
        wakeup_fd(&fd).unwrap();
        wakeup_fd(&fd).unwrap();
        let mut pfd = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        assert_eq!(nix::poll::poll(&mut pfd, PollTimeout::ZERO).unwrap(), 1);
        drain_evt_fd(&fd).unwrap();
        let mut pfd = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        assert_eq!(nix::poll::poll(&mut pfd, PollTimeout::ZERO).unwrap(), 0);
        /* draining an empty eventfd is not an error */
        drain_evt_fd(&fd).unwrap();
    }

    #[test]
    fn escape_exe_names() {
        assert_eq!(
            EscapeAsciiPrintable(b"game\x00\xff").to_string(),
            "game\\x00\\xff"
        );
    }
}
