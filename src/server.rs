/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Capture server: accepts capture clients and hands their textures to consumers.
 *
 * One worker thread owns the listening socket and the client sockets; it
 * sleeps in `poll` and is woken through an eventfd. Consumers are driven by
 * their host's render loop and only touch the shared state under its mutex.
 * Control records a consumer wants sent are flagged on the client and
 * written by the worker. */
use crate::formats::{drm_has_alpha, DRM_FORMAT_MOD_INVALID};
use crate::protocol::*;
use crate::tag;
use crate::util::{
    drain_evt_fd, ioctl_loop, lock, make_evt_fd, wakeup_fd, EscapeAsciiPrintable,
};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket;
use std::ffi::c_void;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/** Highest level of the import failure ladder */
pub const MAX_IMPORT_FAILURES: u8 = 3;

const DMA_BUF_IOCTL_SYNC: u32 = 0x4008_6200;
const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[derive(Debug, Clone)]
pub struct Options {
    /** Abstract socket name to listen on */
    pub socket_name: String,
    /** How long an activated client may take to send its first texture */
    pub activation_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            socket_name: SOCKET_NAME.to_string(),
            activation_timeout: Duration::from_secs(5),
        }
    }
}

/** Allocation hints for a level of the import failure ladder */
pub fn ladder_hints(level: u8) -> AllocHints {
    match level {
        0 => AllocHints::default(),
        1 => AllocHints {
            no_modifiers: true,
            ..AllocHints::default()
        },
        2 => AllocHints {
            linear: true,
            ..AllocHints::default()
        },
        _ => AllocHints {
            linear: true,
            map_host: true,
            ..AllocHints::default()
        },
    }
}

/** Read-only view of a DMA-BUF, bracketed by DMA_BUF_IOCTL_SYNC */
pub struct HostMapping {
    fd: OwnedFd,
    addr: *mut c_void,
    size: usize,
}

// SAFETY: the mapping is not tied to a thread and is only read through `read`
unsafe impl Send for HostMapping {}

impl Drop for HostMapping {
    fn drop(&mut self) {
        unsafe {
            /* SAFETY: addr[..size] was mapped by `new` and is not referenced elsewhere */
            libc::munmap(self.addr, self.size);
        }
    }
}

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

impl HostMapping {
    /** Map all of `fd`, whose size is found by seeking to its end */
    pub fn new(fd: BorrowedFd<'_>) -> Result<HostMapping, String> {
        let fd = fd
            .try_clone_to_owned()
            .map_err(|x| tag!("Failed to duplicate fd: {}", x))?;
        // SAFETY: plain syscall on an owned fd
        let end = unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_END) };
        if end < 0 {
            return Err(tag!("Failed to get buffer size: {}", Errno::last()));
        }
        if end == 0 {
            return Err(tag!("Cannot map empty buffer"));
        }
        let size = end as usize;
        let addr = unsafe {
            /* SAFETY: fresh mapping, no references to existing memory */
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(tag!("Failed to mmap {} bytes: {}", size, Errno::last()));
        }
        Ok(HostMapping { fd, addr, size })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn sync(&self, flags: u64) {
        let mut arg = DmaBufSync { flags };
        // SAFETY: DMA_BUF_IOCTL_SYNC takes a pointer to struct dma_buf_sync
        let r = unsafe {
            ioctl_loop(
                &self.fd,
                DMA_BUF_IOCTL_SYNC,
                &mut arg as *mut DmaBufSync as *mut c_void,
                "dma-buf sync",
            )
        };
        /* not every exporter implements it */
        if let Err(e) = r {
            debug!("{}", e);
        }
    }

    /** Call `f` with the buffer contents, with CPU read access synchronized */
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.sync(DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ);
        // SAFETY: addr[..size] stays mapped for the lifetime of self
        let data = unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.size) };
        let r = f(data);
        self.sync(DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ);
        r
    }
}

/** One plane of an import request */
#[derive(Debug)]
pub struct DmabufPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub stride: u32,
    pub offset: u32,
}

/** Everything needed to import a client texture */
#[derive(Debug)]
pub struct DmabufImport<'a> {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    /** `None` when the client allocated without a modifier */
    pub modifier: Option<u64>,
    pub planes: Vec<DmabufPlane<'a>>,
}

impl<'a> DmabufImport<'a> {
    pub fn new(data: &TextureData, fds: &'a [OwnedFd]) -> DmabufImport<'a> {
        let n = (data.nfd as usize).min(fds.len());
        DmabufImport {
            width: data.width as u32,
            height: data.height as u32,
            fourcc: data.format,
            modifier: (data.modifier != DRM_FORMAT_MOD_INVALID).then_some(data.modifier),
            planes: (0..n)
                .map(|i| DmabufPlane {
                    fd: fds[i].as_fd(),
                    stride: data.strides[i] as u32,
                    offset: data.offsets[i] as u32,
                })
                .collect(),
        }
    }
}

/** GPU side of a consumer */
pub trait TextureBackend {
    type Texture;

    /** UUID of the GPU textures are imported on */
    fn device_uuid(&self) -> [u8; 16];

    /** Create a texture sharing the client's DMA-BUF memory */
    fn import_dmabuf(&mut self, import: &DmabufImport<'_>) -> Result<Self::Texture, String>;

    /** Create a texture that will be filled from CPU memory */
    fn create_host_texture(&mut self, data: &TextureData) -> Result<Self::Texture, String>;

    /** Refresh a host texture from a linear copy of the client image */
    fn upload_host(
        &mut self,
        texture: &mut Self::Texture,
        data: &TextureData,
        bytes: &[u8],
    ) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSettings {
    /** Executable name to capture; empty for any */
    pub window: String,
    /** Capture anything but `window` */
    pub exclude: bool,
    pub show_cursor: bool,
    pub allow_transparency: bool,
}

/** Does a client with this executable name suit the consumer? */
pub fn client_matches(settings: &ConsumerSettings, exe: Option<&str>) -> bool {
    if settings.window.is_empty() {
        return true;
    }
    let Some(exe) = exe else {
        return false;
    };
    (exe == settings.window) != settings.exclude
}

/** A connected capture client, as listed for a window picker */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: u64,
    pub pid: Option<i32>,
    pub exe: Option<String>,
}

/** The texture a consumer is currently showing */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub client_id: u64,
    pub width: i32,
    pub height: i32,
    pub flip: bool,
    pub fourcc: u32,
    /** Blend with alpha instead of treating the image as opaque */
    pub has_alpha: bool,
    /** Refreshed from CPU memory by `Consumer::render` */
    pub host_mapped: bool,
}

struct Client {
    id: u64,
    pid: Option<i32>,
    sock: Arc<OwnedFd>,
    cdata: Option<ClientData>,
    tdata: Option<TextureData>,
    fds: Vec<OwnedFd>,
    buf_id: u64,
    activated: u32,
    import_failures: u8,
    /** A control record must be sent */
    control_dirty: bool,
    unresponsive: bool,
    map: Option<HostMapping>,
}

impl Client {
    fn control(&self, device_uuid: [u8; 16]) -> ControlData {
        ControlData {
            capturing: self.activated > 0,
            hints: ladder_hints(self.import_failures),
            device_uuid,
        }
    }

    fn exe(&self) -> Option<&str> {
        self.cdata.as_ref().map(|c| c.exe.as_str())
    }

    fn clear_texture(&mut self) {
        self.map = None;
        self.fds.clear();
        self.tdata = None;
    }
}

struct ServerState {
    clients: Vec<Client>,
    next_id: u64,
    device_uuid: [u8; 16],
    quit: bool,
}

impl ServerState {
    fn client(&mut self, id: u64) -> Option<&mut Client> {
        self.clients
            .iter_mut()
            .find(|c| c.id == id && !c.unresponsive)
    }

    fn remove(&mut self, id: u64) {
        if let Some(pos) = self.clients.iter().position(|c| c.id == id) {
            let c = self.clients.remove(pos);
            info!(
                "Client {} ({}) removed",
                c.id,
                EscapeAsciiPrintable(c.exe().unwrap_or("unknown").as_bytes())
            );
        }
    }
}

struct Shared {
    state: Mutex<ServerState>,
    wake: OwnedFd,
    options: Options,
}

impl Shared {
    fn wakeup(&self) {
        if let Err(e) = wakeup_fd(&self.wake) {
            error!("{}", e);
        }
    }
}

pub struct Server {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

fn listen(name: &str) -> Result<OwnedFd, String> {
    let addr = socket_address(name)?;
    let sock = socket::socket(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        socket::SockFlag::SOCK_CLOEXEC | socket::SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(|x| tag!("Failed to create socket: {}", x))?;
    socket::bind(sock.as_raw_fd(), &addr)
        .map_err(|x| tag!("Failed to bind socket '{}': {}", name, x))?;
    let backlog = socket::Backlog::new(1).map_err(|x| tag!("Bad backlog: {}", x))?;
    socket::listen(&sock, backlog).map_err(|x| tag!("Failed to listen: {}", x))?;
    Ok(sock)
}

impl Server {
    /** Bind the socket and start the worker thread */
    pub fn start(options: Options, device_uuid: [u8; 16]) -> Result<Server, String> {
        let listener = listen(&options.socket_name)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(ServerState {
                clients: Vec::new(),
                next_id: 1,
                device_uuid,
                quit: false,
            }),
            wake: make_evt_fd()?,
            options,
        });
        let s = shared.clone();
        let worker = std::thread::Builder::new()
            .name("vkcapture-server".into())
            .spawn(move || {
                if let Err(e) = worker_loop(&s, listener) {
                    error!("Server worker failed: {}", e);
                }
                lock(&s.state).clients.clear();
            })
            .map_err(|x| tag!("Failed to spawn worker thread: {}", x))?;
        info!("Listening on '{}'", shared.options.socket_name);
        Ok(Server {
            shared,
            worker: Some(worker),
        })
    }

    /** Connected clients, in connection order */
    pub fn clients(&self) -> Vec<ClientInfo> {
        lock(&self.shared.state)
            .clients
            .iter()
            .filter(|c| !c.unresponsive)
            .map(|c| ClientInfo {
                id: c.id,
                pid: c.pid,
                exe: c.cdata.as_ref().map(|x| x.exe.clone()),
            })
            .collect()
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /** Stop the worker and drop all clients */
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        lock(&self.shared.state).quit = true;
        self.shared.wakeup();
        if worker.join().is_err() {
            error!("Server worker panicked");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_clients(shared: &Shared, listener: &OwnedFd) {
    loop {
        let fd = match socket::accept4(
            listener.as_raw_fd(),
            socket::SockFlag::SOCK_CLOEXEC | socket::SockFlag::SOCK_NONBLOCK,
        ) {
            Ok(fd) => fd,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return,
            Err(x) => {
                warn!("Failed to accept client: {}", x);
                return;
            }
        };
        // SAFETY: fd was just returned by accept4 and is owned by nothing else
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };
        let pid = socket::getsockopt(&sock, socket::sockopt::PeerCredentials)
            .map(|c| c.pid())
            .ok();

        let mut state = lock(&shared.state);
        let id = state.next_id;
        state.next_id += 1;
        info!(
            "Client {} connected (pid {})",
            id,
            pid.map(|x| x.to_string()).unwrap_or("?".into())
        );
        state.clients.push(Client {
            id,
            pid,
            sock: Arc::new(sock),
            cdata: None,
            tdata: None,
            fds: Vec::new(),
            buf_id: 0,
            activated: 0,
            import_failures: 0,
            control_dirty: false,
            unresponsive: false,
            map: None,
        });
    }
}

/** Read everything a client has sent; false if it must be dropped */
fn read_client(shared: &Shared, id: u64, sock: &OwnedFd) -> bool {
    loop {
        match recv_client_record(sock) {
            Ok(None) => return true,
            Ok(Some(ClientRecord::Client(cdata))) => {
                let mut state = lock(&shared.state);
                let Some(c) = state.client(id) else {
                    return false;
                };
                if c.cdata.is_some() {
                    warn!("Dropping client {}: repeated CLIENT record", id);
                    return false;
                }
                info!(
                    "Client {} is '{}'",
                    id,
                    EscapeAsciiPrintable(cdata.exe.as_bytes())
                );
                c.cdata = Some(cdata);
            }
            Ok(Some(ClientRecord::Texture(tdata, fds))) => {
                debug!(
                    "Client {} texture {}x{} format {:#x} modifier {:#x} planes {}",
                    id, tdata.width, tdata.height, tdata.format, tdata.modifier, tdata.nfd
                );
                let mut state = lock(&shared.state);
                let Some(c) = state.client(id) else {
                    return false;
                };
                if c.cdata.is_none() {
                    /* received fds are closed on return */
                    warn!("Dropping client {}: TEXTURE record before CLIENT record", id);
                    return false;
                }
                c.map = None;
                /* the old fds are closed here */
                c.fds = fds;
                c.tdata = Some(tdata);
                c.buf_id += 1;
            }
            Err(RecvError::Closed) => {
                debug!("Client {} closed the connection", id);
                return false;
            }
            Err(e) => {
                warn!("Dropping client {}: {}", id, e);
                return false;
            }
        }
    }
}

/** Send pending control records and forget unresponsive clients */
fn flush_clients(shared: &Shared) {
    let mut state = lock(&shared.state);
    let uuid = state.device_uuid;
    let mut dead = Vec::new();
    for c in state.clients.iter_mut() {
        if c.unresponsive {
            warn!("Client {} did not send a texture in time", c.id);
            dead.push(c.id);
            continue;
        }
        if !c.control_dirty {
            continue;
        }
        c.control_dirty = false;
        let control = c.control(uuid);
        debug!("Client {} control {:?}", c.id, control);
        if let Err(e) = send_control(&c.sock, &control) {
            warn!("Dropping client {}: {}", c.id, e);
            dead.push(c.id);
        }
    }
    for id in dead {
        state.remove(id);
    }
}

fn worker_loop(shared: &Shared, listener: OwnedFd) -> Result<(), String> {
    loop {
        flush_clients(shared);

        let socks: Vec<(u64, Arc<OwnedFd>)> = {
            let state = lock(&shared.state);
            if state.quit {
                return Ok(());
            }
            state
                .clients
                .iter()
                .map(|c| (c.id, c.sock.clone()))
                .collect()
        };

        let mut pfds = Vec::with_capacity(2 + socks.len());
        pfds.push(PollFd::new(shared.wake.as_fd(), PollFlags::POLLIN));
        pfds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        for (_, s) in socks.iter() {
            pfds.push(PollFd::new(s.as_fd(), PollFlags::POLLIN));
        }
        match nix::poll::poll(&mut pfds, PollTimeout::NONE) {
            Ok(_) => (),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(x) => return Err(tag!("Failed to poll: {}", x)),
        }
        let revents: Vec<PollFlags> = pfds
            .iter()
            .map(|p| p.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(pfds);

        if revents[0].contains(PollFlags::POLLIN) {
            drain_evt_fd(&shared.wake)?;
        }
        if revents[1].contains(PollFlags::POLLIN) {
            accept_clients(shared, &listener);
        }
        let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        for ((id, sock), ev) in socks.iter().zip(revents[2..].iter()) {
            if !ev.intersects(ready) {
                continue;
            }
            if !read_client(shared, *id, sock) {
                lock(&shared.state).remove(*id);
            }
        }
    }
}

/** Shows the texture of one client at a time */
pub struct Consumer<B: TextureBackend> {
    shared: Arc<Shared>,
    settings: ConsumerSettings,
    bound: Option<u64>,
    buf_id: u64,
    deadline: Option<Instant>,
    texture: Option<B::Texture>,
    info: Option<TextureInfo>,
}

fn deactivate(shared: &Shared, c: &mut Client) {
    c.activated = c.activated.saturating_sub(1);
    if c.activated == 0 {
        debug!("Client {} deactivated", c.id);
        c.control_dirty = true;
        c.clear_texture();
        shared.wakeup();
    }
}

fn activate(shared: &Shared, c: &mut Client) {
    c.activated += 1;
    if c.activated == 1 {
        debug!("Client {} activated", c.id);
        c.control_dirty = true;
        shared.wakeup();
    }
}

impl<B: TextureBackend> Consumer<B> {
    pub fn new(server: &Server, settings: ConsumerSettings) -> Consumer<B> {
        Consumer {
            shared: server.shared.clone(),
            settings,
            bound: None,
            buf_id: 0,
            deadline: None,
            texture: None,
            info: None,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /** Change what to capture; takes effect on the next tick */
    pub fn update_settings(&mut self, settings: ConsumerSettings) {
        self.settings = settings;
        if let Some(ref mut info) = self.info {
            info.has_alpha = self.settings.allow_transparency && drm_has_alpha(info.fourcc);
        }
    }

    pub fn bound_client(&self) -> Option<u64> {
        self.bound
    }

    pub fn texture(&self) -> Option<&B::Texture> {
        self.texture.as_ref()
    }

    pub fn info(&self) -> Option<TextureInfo> {
        self.info
    }

    fn unbind(&mut self) {
        self.bound = None;
        self.buf_id = 0;
        self.deadline = None;
        self.texture = None;
        self.info = None;
    }

    fn load_texture(&mut self, backend: &mut B, c: &mut Client) -> Result<B::Texture, String> {
        let Some(tdata) = c.tdata else {
            return Err(tag!("No texture"));
        };
        if ladder_hints(c.import_failures).map_host {
            let fd = c.fds.first().ok_or_else(|| tag!("No planes"))?;
            let map = HostMapping::new(fd.as_fd())?;
            let mut tex = backend.create_host_texture(&tdata)?;
            map.read(|bytes| backend.upload_host(&mut tex, &tdata, bytes))?;
            c.map = Some(map);
            Ok(tex)
        } else {
            backend.import_dmabuf(&DmabufImport::new(&tdata, &c.fds))
        }
    }

    /** Per-frame update. Returns true iff a new texture was created. */
    pub fn tick(&mut self, backend: &mut B) -> bool {
        let shared = self.shared.clone();
        let mut state = lock(&shared.state);
        let now = Instant::now();

        let Some(id) = self.bound else {
            let settings = &self.settings;
            let found = state
                .clients
                .iter_mut()
                .find(|c| !c.unresponsive && client_matches(settings, c.exe()));
            if let Some(c) = found {
                activate(&shared, c);
                self.bound = Some(c.id);
                self.buf_id = 0;
                self.deadline = Some(now + shared.options.activation_timeout);
            }
            return false;
        };

        let Some(c) = state.client(id) else {
            debug!("Bound client {} is gone", id);
            self.unbind();
            return false;
        };

        let mut created = false;
        if c.buf_id > self.buf_id && c.tdata.is_some() {
            self.texture = None;
            self.info = None;
            self.buf_id = c.buf_id;
            self.deadline = None;
            match self.load_texture(backend, c) {
                Ok(tex) => {
                    if let Some(t) = c.tdata {
                        info!(
                            "Client {} texture {}x{} imported{}",
                            id,
                            t.width,
                            t.height,
                            if c.map.is_some() { " (host mapped)" } else { "" }
                        );
                        self.info = Some(TextureInfo {
                            client_id: id,
                            width: t.width,
                            height: t.height,
                            flip: t.flip,
                            fourcc: t.format,
                            has_alpha: self.settings.allow_transparency && drm_has_alpha(t.format),
                            host_mapped: c.map.is_some(),
                        });
                    }
                    self.texture = Some(tex);
                    created = true;
                }
                Err(e) => {
                    if c.import_failures < MAX_IMPORT_FAILURES {
                        c.import_failures += 1;
                        warn!(
                            "Texture import failed ({}); asking client {} for {:?}",
                            e,
                            id,
                            ladder_hints(c.import_failures)
                        );
                        c.control_dirty = true;
                        shared.wakeup();
                    } else {
                        error!("Texture import failed with every fallback: {}", e);
                    }
                }
            }
        } else if !client_matches(&self.settings, c.exe()) {
            debug!("Client {} no longer matches", id);
            deactivate(&shared, c);
            self.unbind();
            return false;
        }

        if let Some(deadline) = self.deadline {
            if now >= deadline && c.tdata.is_none() {
                warn!("Client {} is unresponsive", id);
                c.unresponsive = true;
                shared.wakeup();
                self.unbind();
            }
        }
        created
    }

    /** Refresh a host mapped texture; a no-op for DMA-BUF imports */
    pub fn render(&mut self, backend: &mut B) -> Result<(), String> {
        let (Some(id), Some(tex)) = (self.bound, self.texture.as_mut()) else {
            return Ok(());
        };
        let mut state = lock(&self.shared.state);
        let Some(c) = state.client(id) else {
            return Ok(());
        };
        let (Some(map), Some(tdata)) = (c.map.as_ref(), c.tdata.as_ref()) else {
            return Ok(());
        };
        map.read(|bytes| backend.upload_host(tex, tdata, bytes))
    }
}

impl<B: TextureBackend> Drop for Consumer<B> {
    fn drop(&mut self) {
        let Some(id) = self.bound else {
            return;
        };
        let mut state = lock(&self.shared.state);
        if let Some(c) = state.client(id) {
            deactivate(&self.shared, c);
        }
    }
}
