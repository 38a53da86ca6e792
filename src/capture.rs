/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! The capture client: one connection per process to the capture server.
 *
 * Hooks call [`CaptureClient::update_socket`] on every present. It polls the
 * server at most once per second, (re)connecting when needed, and tracks the
 * most recent control record. The `should_stop`/`should_init`/`ready`
 * predicates then tell the hook what to do with its export for this frame. */
use crate::protocol::*;
use crate::tag;
use crate::util::{env_flag, lock};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::socket;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/** Minimum time between two polls of the server socket */
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/** Longest executable name sent to the server */
const MAX_EXE_NAME: usize = EXE_NAME_LEN - 1;

/** Capture settings taken from the environment */
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureConfig {
    /** Always request linear tiling (`OBS_VKCAPTURE_LINEAR`) */
    pub linear: bool,
    /** Use the Vulkan-backed export for GL (`OBS_VKCAPTURE_GLVULKAN`) */
    pub glvulkan: bool,
    /** No log output at all (`OBS_VKCAPTURE_QUIET`) */
    pub quiet: bool,
    /** Debug log output (`OBS_VKCAPTURE_DEBUG`) */
    pub debug: bool,
}

impl CaptureConfig {
    pub fn from_env() -> CaptureConfig {
        CaptureConfig {
            linear: env_flag("OBS_VKCAPTURE_LINEAR"),
            glvulkan: env_flag("OBS_VKCAPTURE_GLVULKAN"),
            quiet: env_flag("OBS_VKCAPTURE_QUIET"),
            debug: env_flag("OBS_VKCAPTURE_DEBUG"),
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            log::LevelFilter::Off
        } else if self.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}

static CONFIG: OnceLock<CaptureConfig> = OnceLock::new();

/** Process configuration, read from the environment on first use */
pub fn config() -> &'static CaptureConfig {
    CONFIG.get_or_init(CaptureConfig::from_env)
}

/** Install the logger used inside hooked processes */
pub fn init_logging() {
    crate::logger::init("obs-vkcapture", config().log_level());
}

/** Pick the name to report for this process. Under wine the executable
 * is the preloader, so the thread name (the Windows exe) is used. */
pub fn select_exe_name(exe: &str, comm: Option<&str>) -> String {
    let name = match (exe, comm) {
        ("wine-preloader" | "wine64-preloader", Some(c)) => c.trim_end_matches('\n'),
        _ => exe,
    };
    let mut end = name.len().min(MAX_EXE_NAME);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/** Basename of the running executable, as reported to the server */
pub fn exe_name() -> String {
    let exe = std::fs::read_link("/proc/self/exe")
        .ok()
        .and_then(|p| p.file_name().map(|x| x.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let comm = std::fs::read_to_string("/proc/self/comm").ok();
    select_exe_name(&exe, comm.as_deref())
}

pub struct CaptureClient {
    socket_name: String,
    exe: String,
    conn: Option<OwnedFd>,
    /** Most recent control record; all-false while disconnected */
    control: ControlData,
    /** Allocation hints changed while an export was live */
    reinit: bool,
    /** A TEXTURE record was sent for the current export */
    capturing: bool,
    force_linear: bool,
    last_check: Option<Instant>,
}

impl CaptureClient {
    pub fn new(socket_name: &str, exe: String, force_linear: bool) -> CaptureClient {
        CaptureClient {
            socket_name: socket_name.to_string(),
            exe,
            conn: None,
            control: ControlData::default(),
            reinit: false,
            capturing: false,
            force_linear,
            last_check: None,
        }
    }

    pub fn exe(&self) -> &str {
        &self.exe
    }

    pub fn connected(&self) -> bool {
        self.conn.is_some()
    }

    /** Poll the server, unless that was done less than a second ago */
    pub fn update_socket(&mut self) {
        self.update_socket_at(Instant::now())
    }

    pub fn update_socket_at(&mut self, now: Instant) {
        if let Some(t) = self.last_check {
            if now.saturating_duration_since(t) < CHECK_INTERVAL {
                return;
            }
        }
        self.last_check = Some(now);

        if self.conn.is_none() {
            if let Err(e) = self.try_connect() {
                debug!("{}", e);
                return;
            }
        }
        self.read_control();
    }

    fn try_connect(&mut self) -> Result<(), String> {
        let addr = socket_address(&self.socket_name)?;
        let sock = socket::socket(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            socket::SockFlag::SOCK_CLOEXEC | socket::SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|x| tag!("Failed to create socket: {}", x))?;
        loop {
            match socket::connect(sock.as_raw_fd(), &addr) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(x) => return Err(tag!("Failed to connect to capture server: {}", x)),
            }
        }
        send_client_data(
            &sock,
            &ClientData {
                exe: self.exe.clone(),
            },
        )?;
        info!("Connected to capture server as '{}'", self.exe);
        self.conn = Some(sock);
        Ok(())
    }

    fn read_control(&mut self) {
        loop {
            let Some(ref conn) = self.conn else {
                return;
            };
            match recv_control(conn) {
                Ok(Some(c)) => self.apply_control(c),
                Ok(None) => return,
                Err(RecvError::Closed) => {
                    info!("Capture server disconnected");
                    self.disconnect();
                    return;
                }
                Err(e) => {
                    warn!("Dropping capture server connection: {}", e);
                    self.disconnect();
                    return;
                }
            }
        }
    }

    /** Take a new control record into account */
    pub fn apply_control(&mut self, c: ControlData) {
        if self.capturing && c.hints != self.control.hints {
            debug!(
                "Allocation hints changed: {:?} -> {:?}",
                self.control.hints, c.hints
            );
            self.reinit = true;
        }
        self.control = c;
    }

    fn disconnect(&mut self) {
        self.conn = None;
        self.control = ControlData::default();
    }

    /** The live export must be freed */
    pub fn should_stop(&self) -> bool {
        self.capturing && (self.conn.is_none() || !self.control.capturing || self.reinit)
    }

    /** An export should be created and announced */
    pub fn should_init(&self) -> bool {
        !self.capturing && self.conn.is_some() && self.control.capturing
    }

    /** Frames should be copied into the live export */
    pub fn ready(&self) -> bool {
        self.capturing && !self.should_stop()
    }

    /** Allocation hints for the next export */
    pub fn hints(&self) -> AllocHints {
        let mut h = self.control.hints;
        h.linear |= self.force_linear;
        h
    }

    /** UUID of the GPU the server imports on */
    pub fn device_uuid(&self) -> [u8; 16] {
        self.control.device_uuid
    }

    /** Announce a new export. On failure the connection is dropped. */
    pub fn init_texture(&mut self, data: &TextureData, fds: &[BorrowedFd<'_>]) -> Result<(), String> {
        let Some(ref conn) = self.conn else {
            return Err(tag!("Not connected to capture server"));
        };
        if let Err(e) = send_texture(conn, data, fds) {
            self.disconnect();
            return Err(e);
        }
        info!(
            "Sent texture {}x{} format {:#x} modifier {:#x} planes {}",
            data.width, data.height, data.format, data.modifier, data.nfd
        );
        self.capturing = true;
        self.reinit = false;
        Ok(())
    }

    /** The export was freed */
    pub fn stop(&mut self) {
        self.capturing = false;
        self.reinit = false;
    }
}

static CLIENT: OnceLock<Mutex<CaptureClient>> = OnceLock::new();

/** The process-wide capture client */
pub fn global() -> MutexGuard<'static, CaptureClient> {
    lock(CLIENT.get_or_init(|| {
        Mutex::new(CaptureClient::new(
            SOCKET_NAME,
            exe_name(),
            config().linear,
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;
    use std::os::fd::{AsFd, FromRawFd};

    fn listen(name: &str) -> OwnedFd {
        let sock = socket::socket(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            socket::SockFlag::SOCK_CLOEXEC,
            None,
        )
        .unwrap();
        socket::bind(sock.as_raw_fd(), &socket_address(name).unwrap()).unwrap();
        socket::listen(&sock, socket::Backlog::new(1).unwrap()).unwrap();
        sock
    }

    fn accept(listener: &OwnedFd) -> OwnedFd {
        let fd = socket::accept4(listener.as_raw_fd(), socket::SockFlag::SOCK_CLOEXEC).unwrap();
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    #[test]
    fn wine_exe_names() {
        assert_eq!(select_exe_name("gamebin", Some("ignored\n")), "gamebin");
        assert_eq!(
            select_exe_name("wine-preloader", Some("Game.exe\n")),
            "Game.exe"
        );
        assert_eq!(
            select_exe_name("wine64-preloader", Some("Game64.exe\n")),
            "Game64.exe"
        );
        assert_eq!(select_exe_name("wine-preloader", None), "wine-preloader");
        let long = "x".repeat(60);
        assert_eq!(select_exe_name("wine-preloader", Some(&long)).len(), 47);
        let wide = "é".repeat(30);
        let cut = select_exe_name(&wide, None);
        assert_eq!(cut.len(), 46);
    }

    #[test]
    fn log_level_from_config() {
        let mut c = CaptureConfig::default();
        assert_eq!(c.log_level(), log::LevelFilter::Info);
        c.debug = true;
        assert_eq!(c.log_level(), log::LevelFilter::Debug);
        c.quiet = true;
        assert_eq!(c.log_level(), log::LevelFilter::Off);
    }

    #[test]
    fn client_state_transitions() {
        let name = unique_socket_name("capture");
        let listener = listen(&name);
        let mut client = CaptureClient::new(&name, "gamebin".into(), false);
        let t0 = Instant::now();

        assert!(!client.should_init());
        client.update_socket_at(t0);
        assert!(client.connected());
        let conn = accept(&listener);
        match recv_record_blocking(&conn) {
            ClientRecord::Client(c) => assert_eq!(c.exe, "gamebin"),
            ClientRecord::Texture(..) => panic!("expected client record"),
        }
        assert!(!client.should_init());

        let mut control = ControlData {
            capturing: true,
            hints: AllocHints::default(),
            device_uuid: [7; 16],
        };
        send_control(&conn, &control).unwrap();
        /* rate limited */
        client.update_socket_at(t0 + Duration::from_millis(500));
        assert!(!client.should_init());
        client.update_socket_at(t0 + CHECK_INTERVAL);
        assert!(client.should_init());
        assert_eq!(client.device_uuid(), [7; 16]);

        let (_r, w) = nonblocking_pipe();
        let td = TextureData {
            nfd: 1,
            width: 64,
            height: 32,
            ..TextureData::default()
        };
        client.init_texture(&td, &[w.as_fd()]).unwrap();
        assert!(client.ready());
        assert!(!client.should_init());
        assert!(!client.should_stop());
        match recv_record_blocking(&conn) {
            ClientRecord::Texture(t, fds) => {
                assert_eq!((t.width, t.height), (64, 32));
                assert_eq!(fds.len(), 1);
            }
            ClientRecord::Client(_) => panic!("expected texture record"),
        }

        /* identical control record: nothing to do */
        send_control(&conn, &control).unwrap();
        client.update_socket_at(t0 + 2 * CHECK_INTERVAL);
        assert!(client.ready());

        control.hints.no_modifiers = true;
        send_control(&conn, &control).unwrap();
        client.update_socket_at(t0 + 3 * CHECK_INTERVAL);
        assert!(client.should_stop());
        assert!(!client.ready());
        client.stop();
        assert!(client.should_init());
        assert!(client.hints().no_modifiers);

        client.init_texture(&td, &[w.as_fd()]).unwrap();
        drop(conn);
        client.update_socket_at(t0 + 4 * CHECK_INTERVAL);
        assert!(!client.connected());
        assert!(client.should_stop());
        client.stop();
        assert!(!client.should_init());
    }

    #[test]
    fn forced_linear_hint() {
        let client = CaptureClient::new("/unused", "x".into(), true);
        assert!(client.hints().linear);
        assert!(!client.hints().no_modifiers);
    }
}
