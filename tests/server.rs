/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Capture server tests, with in-process clients and a recording backend */
use nix::fcntl;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::memfd;
use nix::sys::socket;
use nix::unistd;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use vkcapture::formats::{DRM_FORMAT_ARGB8888, DRM_FORMAT_MOD_INVALID, DRM_FORMAT_XRGB8888};
use vkcapture::protocol::*;
use vkcapture::server::*;

const TIMEOUT: Duration = Duration::from_secs(5);
const UUID: [u8; 16] = [7; 16];

fn socket_name(label: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/com/obsproject/vkcapture-test/{}/{}/{}",
        std::process::id(),
        label,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn start(label: &str, activation_timeout: Duration) -> Server {
    let options = Options {
        socket_name: socket_name(label),
        activation_timeout,
    };
    Server::start(options, UUID).unwrap()
}

/** Connect the way the capture engine does, then make the socket nonblocking */
fn connect(server: &Server, exe: Option<&str>) -> OwnedFd {
    let sock = socket::socket(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        socket::SockFlag::SOCK_CLOEXEC,
        None,
    )
    .unwrap();
    let addr = socket_address(&server.options().socket_name).unwrap();
    socket::connect(sock.as_raw_fd(), &addr).unwrap();
    fcntl::fcntl(
        sock.as_raw_fd(),
        fcntl::FcntlArg::F_SETFL(fcntl::OFlag::O_NONBLOCK),
    )
    .unwrap();
    if let Some(exe) = exe {
        send_client_data(&sock, &ClientData { exe: exe.into() }).unwrap();
    }
    sock
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn wait_for_exe(server: &Server, exe: &str) {
    assert!(wait_until(|| server
        .clients()
        .iter()
        .any(|c| c.exe.as_deref() == Some(exe))));
}

fn poll_in(sock: &OwnedFd, ms: u16) {
    let mut pfd = [PollFd::new(sock.as_fd(), PollFlags::POLLIN)];
    let _ = nix::poll::poll(&mut pfd, PollTimeout::from(ms));
}

fn wait_control(sock: &OwnedFd) -> ControlData {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match recv_control(sock) {
            Ok(Some(c)) => return c,
            Ok(None) => (),
            Err(e) => panic!("no control record: {}", e),
        }
        assert!(Instant::now() < deadline, "timed out waiting for control");
        poll_in(sock, 100);
    }
}

/** Return true iff the server closed the connection */
fn wait_closed(sock: &OwnedFd) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        match recv_control(sock) {
            Err(RecvError::Closed) => return true,
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => poll_in(sock, 100),
        }
    }
    false
}

fn plane(size: usize) -> OwnedFd {
    let fd = memfd::memfd_create(c"vkcapture-plane", memfd::MemFdCreateFlag::MFD_CLOEXEC).unwrap();
    unistd::ftruncate(&fd, size as i64).unwrap();
    fd
}

fn texture(width: i32, height: i32, format: u32) -> TextureData {
    TextureData {
        nfd: 1,
        width,
        height,
        format,
        strides: [width * 4, 0, 0, 0],
        ..TextureData::default()
    }
}

fn send_planes(sock: &OwnedFd, data: &TextureData, planes: &[OwnedFd]) {
    let fds: Vec<BorrowedFd<'_>> = planes.iter().map(|p| p.as_fd()).collect();
    send_texture(sock, data, &fds).unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Imported {
    width: u32,
    height: u32,
    fourcc: u32,
    modifier: Option<u64>,
    strides: Vec<u32>,
    offsets: Vec<u32>,
}

#[derive(Debug)]
struct MockTexture {
    width: i32,
    height: i32,
    host: bool,
    uploaded: usize,
}

#[derive(Default)]
struct MockBackend {
    reject_dmabuf: bool,
    imports: Vec<Imported>,
    host_textures: u32,
    uploads: u32,
}

impl TextureBackend for MockBackend {
    type Texture = MockTexture;

    fn device_uuid(&self) -> [u8; 16] {
        UUID
    }

    fn import_dmabuf(&mut self, import: &DmabufImport<'_>) -> Result<MockTexture, String> {
        self.imports.push(Imported {
            width: import.width,
            height: import.height,
            fourcc: import.fourcc,
            modifier: import.modifier,
            strides: import.planes.iter().map(|p| p.stride).collect(),
            offsets: import.planes.iter().map(|p| p.offset).collect(),
        });
        if self.reject_dmabuf {
            return Err("rejected".into());
        }
        Ok(MockTexture {
            width: import.width as i32,
            height: import.height as i32,
            host: false,
            uploaded: 0,
        })
    }

    fn create_host_texture(&mut self, data: &TextureData) -> Result<MockTexture, String> {
        self.host_textures += 1;
        Ok(MockTexture {
            width: data.width,
            height: data.height,
            host: true,
            uploaded: 0,
        })
    }

    fn upload_host(
        &mut self,
        texture: &mut MockTexture,
        _data: &TextureData,
        bytes: &[u8],
    ) -> Result<(), String> {
        self.uploads += 1;
        texture.uploaded = bytes.len();
        Ok(())
    }
}

/** Tick until a new texture is created; false on timeout */
fn tick_until_texture(consumer: &mut Consumer<MockBackend>, backend: &mut MockBackend) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if consumer.tick(backend) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn tick_until_bound(consumer: &mut Consumer<MockBackend>, backend: &mut MockBackend) -> u64 {
    assert!(wait_until(|| {
        consumer.tick(backend);
        consumer.bound_client().is_some()
    }));
    consumer.bound_client().unwrap()
}

#[test]
fn capture_happy_path() {
    let server = start("happy", TIMEOUT);
    let client = connect(&server, Some("game"));
    wait_for_exe(&server, "game");

    let mut backend = MockBackend::default();
    let settings = ConsumerSettings {
        allow_transparency: true,
        ..ConsumerSettings::default()
    };
    let mut consumer = Consumer::new(&server, settings);
    let id = tick_until_bound(&mut consumer, &mut backend);

    let control = wait_control(&client);
    assert!(control.capturing);
    assert_eq!(control.hints, AllocHints::default());
    assert_eq!(control.device_uuid, UUID);

    let data = texture(1280, 720, DRM_FORMAT_ARGB8888);
    send_planes(&client, &data, &[plane(1280 * 720 * 4)]);
    assert!(tick_until_texture(&mut consumer, &mut backend));

    assert_eq!(
        backend.imports,
        [Imported {
            width: 1280,
            height: 720,
            fourcc: DRM_FORMAT_ARGB8888,
            modifier: None,
            strides: vec![1280 * 4],
            offsets: vec![0],
        }]
    );
    let info = consumer.info().unwrap();
    assert_eq!(info.client_id, id);
    assert_eq!((info.width, info.height), (1280, 720));
    assert!(info.has_alpha && !info.host_mapped && !info.flip);
    let tex = consumer.texture().unwrap();
    assert_eq!((tex.width, tex.height, tex.host), (1280, 720, false));
    /* nothing to refresh for a DMA-BUF import */
    consumer.render(&mut backend).unwrap();
    assert_eq!(backend.uploads, 0);

    /* no new buffer, no new texture */
    assert!(!consumer.tick(&mut backend));

    let mut opaque = consumer.settings().clone();
    opaque.allow_transparency = false;
    consumer.update_settings(opaque);
    assert!(!consumer.info().unwrap().has_alpha);

    drop(consumer);
    assert!(!wait_control(&client).capturing);
}

#[test]
fn opaque_formats_never_blend() {
    let server = start("opaque", TIMEOUT);
    let client = connect(&server, Some("game"));
    wait_for_exe(&server, "game");

    let mut backend = MockBackend::default();
    let settings = ConsumerSettings {
        allow_transparency: true,
        ..ConsumerSettings::default()
    };
    let mut consumer = Consumer::new(&server, settings);
    tick_until_bound(&mut consumer, &mut backend);
    assert!(wait_control(&client).capturing);

    send_planes(&client, &texture(64, 64, DRM_FORMAT_XRGB8888), &[plane(64 * 64 * 4)]);
    assert!(tick_until_texture(&mut consumer, &mut backend));
    assert!(!consumer.info().unwrap().has_alpha);
}

#[test]
fn exclude_selects_other_client() {
    let server = start("exclude", TIMEOUT);
    let a = connect(&server, Some("gameA"));
    wait_for_exe(&server, "gameA");
    let b = connect(&server, Some("gameB"));
    wait_for_exe(&server, "gameB");

    let mut backend = MockBackend::default();
    let settings = ConsumerSettings {
        window: "gameA".into(),
        exclude: true,
        ..ConsumerSettings::default()
    };
    let mut consumer = Consumer::new(&server, settings);
    let id = tick_until_bound(&mut consumer, &mut backend);
    let clients = server.clients();
    let bound = clients.iter().find(|c| c.id == id).unwrap();
    assert_eq!(bound.exe.as_deref(), Some("gameB"));

    assert!(wait_control(&b).capturing);
    poll_in(&a, 100);
    assert!(recv_control(&a).unwrap().is_none());

    /* switching to include mode moves the capture over */
    consumer.update_settings(ConsumerSettings {
        window: "gameA".into(),
        ..ConsumerSettings::default()
    });
    assert!(wait_until(|| {
        consumer.tick(&mut backend);
        consumer
            .bound_client()
            .is_some_and(|x| x != id)
    }));
    assert!(!wait_control(&b).capturing);
    assert!(wait_control(&a).capturing);
}

#[test]
fn texture_before_client_record_drops_client() {
    let server = start("texture-first", TIMEOUT);
    let eager = connect(&server, None);
    assert!(wait_until(|| server.clients().len() == 1));

    let p = plane(64 * 64 * 4);
    send_planes(&eager, &texture(64, 64, DRM_FORMAT_ARGB8888), &[p]);
    assert!(wait_closed(&eager));
    assert!(wait_until(|| server.clients().is_empty()));
}

#[test]
fn repeated_client_record_drops_client() {
    let server = start("renamed", TIMEOUT);
    let client = connect(&server, Some("game"));
    wait_for_exe(&server, "game");

    send_client_data(
        &client,
        &ClientData {
            exe: "renamed".into(),
        },
    )
    .unwrap();
    assert!(wait_closed(&client));
    assert!(wait_until(|| server.clients().is_empty()));

    /* a well behaved client on the same server is unaffected */
    let _other = connect(&server, Some("other"));
    wait_for_exe(&server, "other");
    assert!(server
        .clients()
        .iter()
        .all(|c| c.exe.as_deref() != Some("renamed")));
}

#[test]
fn import_failures_walk_the_ladder() {
    let server = start("ladder", TIMEOUT);
    let client = connect(&server, Some("game"));
    wait_for_exe(&server, "game");

    let mut backend = MockBackend {
        reject_dmabuf: true,
        ..MockBackend::default()
    };
    let mut consumer = Consumer::new(&server, ConsumerSettings::default());
    tick_until_bound(&mut consumer, &mut backend);
    assert_eq!(wait_control(&client).hints, AllocHints::default());

    let data = texture(320, 240, DRM_FORMAT_ARGB8888);
    let expected = [
        AllocHints {
            no_modifiers: true,
            ..AllocHints::default()
        },
        AllocHints {
            linear: true,
            ..AllocHints::default()
        },
        AllocHints {
            linear: true,
            map_host: true,
            ..AllocHints::default()
        },
    ];
    for (i, hints) in expected.iter().enumerate() {
        send_planes(&client, &data, &[plane(320 * 240 * 4)]);
        assert!(wait_until(|| {
            consumer.tick(&mut backend);
            backend.imports.len() == i + 1
        }));
        let control = wait_control(&client);
        assert!(control.capturing);
        assert_eq!(control.hints, *hints);
        assert!(consumer.texture().is_none());
    }

    /* the last rung maps the buffer instead of importing it */
    send_planes(&client, &data, &[plane(320 * 240 * 4)]);
    assert!(tick_until_texture(&mut consumer, &mut backend));
    assert_eq!(backend.imports.len(), 3);
    assert_eq!(backend.host_textures, 1);
    let info = consumer.info().unwrap();
    assert!(info.host_mapped);
    assert_eq!(consumer.texture().unwrap().uploaded, 320 * 240 * 4);

    let before = backend.uploads;
    consumer.render(&mut backend).unwrap();
    consumer.render(&mut backend).unwrap();
    assert_eq!(backend.uploads, before + 2);
}

#[test]
fn silent_client_is_dropped() {
    let server = start("silent", Duration::from_millis(200));
    let client = connect(&server, Some("stuck"));
    wait_for_exe(&server, "stuck");

    let mut backend = MockBackend::default();
    let mut consumer = Consumer::new(&server, ConsumerSettings::default());
    tick_until_bound(&mut consumer, &mut backend);
    assert!(wait_control(&client).capturing);

    assert!(wait_until(|| {
        consumer.tick(&mut backend);
        consumer.bound_client().is_none()
    }));
    assert!(wait_until(|| server.clients().is_empty()));
    assert!(wait_closed(&client));
}

#[test]
fn deactivation_forgets_texture() {
    let server = start("forget", TIMEOUT);
    let client = connect(&server, Some("game"));
    wait_for_exe(&server, "game");

    let mut backend = MockBackend::default();
    let mut first = Consumer::new(&server, ConsumerSettings::default());
    tick_until_bound(&mut first, &mut backend);
    assert!(wait_control(&client).capturing);
    send_planes(&client, &texture(16, 16, DRM_FORMAT_ARGB8888), &[plane(1024)]);
    assert!(tick_until_texture(&mut first, &mut backend));
    drop(first);
    assert!(!wait_control(&client).capturing);

    let mut second = Consumer::new(&server, ConsumerSettings::default());
    tick_until_bound(&mut second, &mut backend);
    assert!(wait_control(&client).capturing);
    for _ in 0..10 {
        assert!(!second.tick(&mut backend));
    }
    assert!(second.info().is_none());

    send_planes(&client, &texture(32, 16, DRM_FORMAT_ARGB8888), &[plane(2048)]);
    assert!(tick_until_texture(&mut second, &mut backend));
    assert_eq!(second.info().unwrap().width, 32);
}

#[test]
fn shared_client_stays_active() {
    let server = start("shared", TIMEOUT);
    let client = connect(&server, Some("game"));
    wait_for_exe(&server, "game");

    let mut backend = MockBackend::default();
    let mut first = Consumer::new(&server, ConsumerSettings::default());
    let mut second = Consumer::new(&server, ConsumerSettings::default());
    tick_until_bound(&mut first, &mut backend);
    tick_until_bound(&mut second, &mut backend);
    assert!(wait_control(&client).capturing);

    drop(first);
    /* still activated by the second consumer: no control record */
    poll_in(&client, 100);
    assert!(recv_control(&client).unwrap().is_none());
    drop(second);
    assert!(!wait_control(&client).capturing);
}

#[test]
fn multi_plane_texture() {
    let server = start("planes", TIMEOUT);
    let client = connect(&server, Some("game"));
    wait_for_exe(&server, "game");

    let mut backend = MockBackend::default();
    let mut consumer = Consumer::new(&server, ConsumerSettings::default());
    tick_until_bound(&mut consumer, &mut backend);
    assert!(wait_control(&client).capturing);

    let data = TextureData {
        nfd: 3,
        width: 1920,
        height: 1080,
        format: DRM_FORMAT_ARGB8888,
        strides: [7680, 256, 128, 0],
        offsets: [0, 0, 4096, 0],
        modifier: 0x0200_0000_0000_0001,
        flip: true,
        ..TextureData::default()
    };
    let planes = [plane(4096), plane(4096), plane(8192)];
    send_planes(&client, &data, &planes);
    assert!(tick_until_texture(&mut consumer, &mut backend));

    let import = &backend.imports[0];
    assert_eq!(import.modifier, Some(0x0200_0000_0000_0001));
    assert_eq!(import.strides, [7680, 256, 128]);
    assert_eq!(import.offsets, [0, 0, 4096]);
    assert!(consumer.info().unwrap().flip);
}

#[test]
fn client_listing() {
    let server = start("listing", TIMEOUT);
    let a = connect(&server, Some("gameA"));
    wait_for_exe(&server, "gameA");
    let b = connect(&server, Some("gameB"));
    wait_for_exe(&server, "gameB");

    let clients = server.clients();
    assert_eq!(clients.len(), 2);
    assert!(clients[0].id < clients[1].id);
    assert_eq!(clients[0].exe.as_deref(), Some("gameA"));
    for c in clients.iter() {
        assert_eq!(c.pid, Some(std::process::id() as i32));
    }

    drop(a);
    assert!(wait_until(|| server.clients().len() == 1));
    assert_eq!(server.clients()[0].exe.as_deref(), Some("gameB"));
    drop(b);
    assert!(wait_until(|| server.clients().is_empty()));
}

#[test]
fn malformed_records_drop_client() {
    let server = start("malformed", TIMEOUT);

    /* TEXTURE record announcing more fds than it carries */
    let short = connect(&server, Some("short"));
    wait_for_exe(&server, "short");
    let mut data = texture(64, 64, DRM_FORMAT_ARGB8888);
    data.nfd = 2;
    let p = plane(64);
    send_record(&short, &data.encode(), &[p.as_raw_fd()]).unwrap();
    assert!(wait_closed(&short));

    /* record of the wrong length */
    let truncated = connect(&server, Some("truncated"));
    wait_for_exe(&server, "truncated");
    send_record(&truncated, &[TEXTURE_DATA_TYPE; 64], &[]).unwrap();
    assert!(wait_closed(&truncated));

    /* unknown type */
    let unknown = connect(&server, Some("unknown"));
    wait_for_exe(&server, "unknown");
    let mut buf = [0u8; CLIENT_DATA_SIZE];
    buf[0] = 42;
    send_record(&unknown, &buf, &[]).unwrap();
    assert!(wait_closed(&unknown));

    assert!(wait_until(|| server.clients().is_empty()));
}

#[test]
fn shutdown_closes_clients() {
    let mut server = start("shutdown", TIMEOUT);
    let client = connect(&server, Some("game"));
    wait_for_exe(&server, "game");
    server.shutdown();
    assert!(server.clients().is_empty());
    assert!(wait_closed(&client));
    /* a second call is harmless */
    server.shutdown();
}
