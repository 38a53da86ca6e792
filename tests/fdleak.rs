/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Check that the server closes every descriptor it receives */
use nix::fcntl;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::memfd;
use nix::sys::socket;
use nix::unistd;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use vkcapture::formats::DRM_FORMAT_ARGB8888;
use vkcapture::protocol::*;
use vkcapture::server::*;

/** fd counts are process wide, so tests here must not overlap */
static FD_LOCK: Mutex<()> = Mutex::new(());

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

struct NullBackend;

impl TextureBackend for NullBackend {
    type Texture = ();

    fn device_uuid(&self) -> [u8; 16] {
        [0; 16]
    }
    fn import_dmabuf(&mut self, _import: &DmabufImport<'_>) -> Result<(), String> {
        Ok(())
    }
    fn create_host_texture(&mut self, _data: &TextureData) -> Result<(), String> {
        Ok(())
    }
    fn upload_host(&mut self, _: &mut (), _: &TextureData, _: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

fn connect(name: &str) -> OwnedFd {
    let sock = socket::socket(
        socket::AddressFamily::Unix,
        socket::SockType::Stream,
        socket::SockFlag::SOCK_CLOEXEC,
        None,
    )
    .unwrap();
    socket::connect(sock.as_raw_fd(), &socket_address(name).unwrap()).unwrap();
    fcntl::fcntl(
        sock.as_raw_fd(),
        fcntl::FcntlArg::F_SETFL(fcntl::OFlag::O_NONBLOCK),
    )
    .unwrap();
    sock
}

fn plane() -> OwnedFd {
    let fd = memfd::memfd_create(c"fdleak", memfd::MemFdCreateFlag::MFD_CLOEXEC).unwrap();
    unistd::ftruncate(&fd, 4096).unwrap();
    fd
}

fn wait_capturing(sock: &OwnedFd) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(c) = recv_control(sock).unwrap() {
            if c.capturing {
                return;
            }
        }
        assert!(Instant::now() < deadline);
        let mut pfd = [PollFd::new(sock.as_fd(), PollFlags::POLLIN)];
        let _ = nix::poll::poll(&mut pfd, PollTimeout::from(100u16));
    }
}

#[test]
fn received_fds_are_closed() {
    let _guard = FD_LOCK.lock().unwrap();
    let name = format!("/com/obsproject/vkcapture-test/{}/fdleak", std::process::id());
    let options = Options {
        socket_name: name.clone(),
        ..Options::default()
    };

    let before = open_fds();
    {
        let mut server = Server::start(options, [0; 16]).unwrap();
        let client = connect(&name);
        send_client_data(&client, &ClientData { exe: "game".into() }).unwrap();
        assert!(wait_until(|| server.clients().len() == 1));

        let mut backend = NullBackend;
        let mut consumer = Consumer::new(&server, ConsumerSettings::default());
        assert!(wait_until(|| {
            consumer.tick(&mut backend);
            consumer.bound_client().is_some()
        }));
        wait_capturing(&client);

        let data = TextureData {
            nfd: 2,
            width: 32,
            height: 32,
            format: DRM_FORMAT_ARGB8888,
            strides: [128, 128, 0, 0],
            offsets: [0, 0, 0, 0],
            ..TextureData::default()
        };
        /* each new texture replaces, and closes, the previous planes */
        for _ in 0..8 {
            let planes = [plane(), plane()];
            send_texture(&client, &data, &[planes[0].as_fd(), planes[1].as_fd()]).unwrap();
            assert!(wait_until(|| consumer.tick(&mut backend)));
        }

        /* a bad record's fds are closed as well */
        let bad = connect(&name);
        let extra = plane();
        send_record(&bad, &[CLIENT_DATA_TYPE; CLIENT_DATA_SIZE], &[extra.as_raw_fd()]).unwrap();
        assert!(wait_until(|| matches!(recv_control(&bad), Err(RecvError::Closed))));
        assert_eq!(server.clients().len(), 1);

        drop(consumer);
        server.shutdown();
    }
    assert!(wait_until(|| open_fds() == before), "{} != {}", open_fds(), before);
}
