/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Wire records exchanged between capture clients and the server.
 *
 * Every record is a fixed-size, little-endian block written with a single
 * `sendmsg` and read with a single `recvmsg`. Clients send one CLIENT record
 * followed by TEXTURE records, each of which carries its DMA-BUF planes as
 * SCM_RIGHTS ancillary data. The server answers with unframed control
 * records. */
use crate::tag;
use nix::errno::Errno;
use nix::sys::socket;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/** Abstract socket name (without the leading NUL) the server listens on */
pub const SOCKET_NAME: &str = "/com/obsproject/vkcapture";

pub const CLIENT_DATA_TYPE: u8 = 10;
pub const TEXTURE_DATA_TYPE: u8 = 11;

pub const CLIENT_DATA_SIZE: usize = 128;
pub const TEXTURE_DATA_SIZE: usize = 128;
pub const CONTROL_DATA_SIZE: usize = 32;

/** Maximum number of DMA-BUF planes (and fds) in one TEXTURE record */
pub const MAX_PLANES: usize = 4;
/** Size of the NUL-padded executable name field */
pub const EXE_NAME_LEN: usize = 48;

/* TEXTURE record layout */
const TEX_NFD: usize = 1;
const TEX_WIDTH: usize = 4;
const TEX_HEIGHT: usize = 8;
const TEX_FORMAT: usize = 12;
const TEX_STRIDES: usize = 16;
const TEX_OFFSETS: usize = 32;
const TEX_MODIFIER: usize = 48;
const TEX_WINID: usize = 56;
const TEX_FLIP: usize = 60;
const TEX_COLOR_SPACE: usize = 64;

/* Control record layout */
const CTL_CAPTURING: usize = 0;
const CTL_NO_MODIFIERS: usize = 1;
const CTL_LINEAR: usize = 2;
const CTL_MAP_HOST: usize = 3;
const CTL_UUID: usize = 4;

const _: () = assert!(TEX_COLOR_SPACE + 4 <= TEXTURE_DATA_SIZE);
const _: () = assert!(CTL_UUID + 16 <= CONTROL_DATA_SIZE);
const _: () = assert!(1 + EXE_NAME_LEN <= CLIENT_DATA_SIZE);

/** Allocation hints the server asks the exporter to honor */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocHints {
    /** Do not use DRM format modifiers; allocate with linear tiling and MOD_INVALID */
    pub no_modifiers: bool,
    /** Only allow DRM_FORMAT_MOD_LINEAR */
    pub linear: bool,
    /** Allocate host visible, coherent, cached memory that the server can mmap */
    pub map_host: bool,
}

/** CLIENT record: identifies the capturing process */
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientData {
    pub exe: String,
}

/** TEXTURE record: layout of an exported DMA-BUF image */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureData {
    pub nfd: u8,
    pub width: i32,
    pub height: i32,
    /** DRM fourcc */
    pub format: u32,
    pub strides: [i32; MAX_PLANES],
    pub offsets: [i32; MAX_PLANES],
    /** DRM format modifier, or `DRM_FORMAT_MOD_INVALID` */
    pub modifier: u64,
    pub winid: u32,
    pub flip: bool,
    pub color_space: u32,
}

/** Control record sent from the server to a client */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlData {
    pub capturing: bool,
    pub hints: AllocHints,
    /** UUID of the consumer's GPU */
    pub device_uuid: [u8; 16],
}

/** A record received by the server */
#[derive(Debug)]
pub enum ClientRecord {
    Client(ClientData),
    /* The fds are exactly `nfd` in number */
    Texture(TextureData, Vec<OwnedFd>),
}

#[derive(Debug)]
pub enum RecvError {
    /** The peer closed the connection (EOF or ECONNRESET) */
    Closed,
    /** The peer violated the framing rules */
    Protocol(String),
    /** Any other socket error */
    Io(String),
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvError::Closed => write!(f, "connection closed"),
            RecvError::Protocol(x) => write!(f, "protocol violation: {}", x),
            RecvError::Io(x) => write!(f, "{}", x),
        }
    }
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}
fn get_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}
fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}
fn put_i32(buf: &mut [u8], at: usize, v: i32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

impl ClientData {
    pub fn encode(&self) -> [u8; CLIENT_DATA_SIZE] {
        let mut buf = [0u8; CLIENT_DATA_SIZE];
        buf[0] = CLIENT_DATA_TYPE;
        let name = self.exe.as_bytes();
        /* keep a terminating NUL */
        let len = name.len().min(EXE_NAME_LEN - 1);
        buf[1..1 + len].copy_from_slice(&name[..len]);
        buf
    }
    pub fn decode(buf: &[u8; CLIENT_DATA_SIZE]) -> ClientData {
        let field = &buf[1..1 + EXE_NAME_LEN];
        let end = field.iter().position(|x| *x == 0).unwrap_or(EXE_NAME_LEN);
        ClientData {
            exe: String::from_utf8_lossy(&field[..end]).into_owned(),
        }
    }
}

impl Default for TextureData {
    fn default() -> Self {
        TextureData {
            nfd: 0,
            width: 0,
            height: 0,
            format: 0,
            strides: [0; MAX_PLANES],
            offsets: [0; MAX_PLANES],
            modifier: crate::formats::DRM_FORMAT_MOD_INVALID,
            winid: 0,
            flip: false,
            color_space: 0,
        }
    }
}

impl TextureData {
    pub fn encode(&self) -> [u8; TEXTURE_DATA_SIZE] {
        let mut buf = [0u8; TEXTURE_DATA_SIZE];
        buf[0] = TEXTURE_DATA_TYPE;
        buf[TEX_NFD] = self.nfd;
        put_i32(&mut buf, TEX_WIDTH, self.width);
        put_i32(&mut buf, TEX_HEIGHT, self.height);
        put_u32(&mut buf, TEX_FORMAT, self.format);
        for i in 0..MAX_PLANES {
            put_i32(&mut buf, TEX_STRIDES + 4 * i, self.strides[i]);
            put_i32(&mut buf, TEX_OFFSETS + 4 * i, self.offsets[i]);
        }
        buf[TEX_MODIFIER..TEX_MODIFIER + 8].copy_from_slice(&self.modifier.to_le_bytes());
        put_u32(&mut buf, TEX_WINID, self.winid);
        buf[TEX_FLIP] = self.flip as u8;
        put_u32(&mut buf, TEX_COLOR_SPACE, self.color_space);
        buf
    }
    pub fn decode(buf: &[u8; TEXTURE_DATA_SIZE]) -> TextureData {
        let mut strides = [0; MAX_PLANES];
        let mut offsets = [0; MAX_PLANES];
        for i in 0..MAX_PLANES {
            strides[i] = get_i32(buf, TEX_STRIDES + 4 * i);
            offsets[i] = get_i32(buf, TEX_OFFSETS + 4 * i);
        }
        TextureData {
            nfd: buf[TEX_NFD],
            width: get_i32(buf, TEX_WIDTH),
            height: get_i32(buf, TEX_HEIGHT),
            format: get_u32(buf, TEX_FORMAT),
            strides,
            offsets,
            modifier: u64::from_le_bytes(buf[TEX_MODIFIER..TEX_MODIFIER + 8].try_into().unwrap()),
            winid: get_u32(buf, TEX_WINID),
            flip: buf[TEX_FLIP] != 0,
            color_space: get_u32(buf, TEX_COLOR_SPACE),
        }
    }
}

impl ControlData {
    pub fn encode(&self) -> [u8; CONTROL_DATA_SIZE] {
        let mut buf = [0u8; CONTROL_DATA_SIZE];
        buf[CTL_CAPTURING] = self.capturing as u8;
        buf[CTL_NO_MODIFIERS] = self.hints.no_modifiers as u8;
        buf[CTL_LINEAR] = self.hints.linear as u8;
        buf[CTL_MAP_HOST] = self.hints.map_host as u8;
        buf[CTL_UUID..CTL_UUID + 16].copy_from_slice(&self.device_uuid);
        buf
    }
    pub fn decode(buf: &[u8; CONTROL_DATA_SIZE]) -> ControlData {
        ControlData {
            capturing: buf[CTL_CAPTURING] != 0,
            hints: AllocHints {
                no_modifiers: buf[CTL_NO_MODIFIERS] != 0,
                linear: buf[CTL_LINEAR] != 0,
                map_host: buf[CTL_MAP_HOST] != 0,
            },
            device_uuid: buf[CTL_UUID..CTL_UUID + 16].try_into().unwrap(),
        }
    }
}

/** Address of the abstract Unix socket with the given name */
pub fn socket_address(name: &str) -> Result<UnixAddr, String> {
    UnixAddr::new_abstract(name.as_bytes())
        .map_err(|x| tag!("Failed to build socket address for '{}': {}", name, x))
}

/** Send one record with optional fds; the record must be written completely */
pub fn send_record(sock: &OwnedFd, data: &[u8], fds: &[RawFd]) -> Result<(), String> {
    let iovs = [IoSlice::new(data)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    loop {
        let r = socket::sendmsg::<()>(
            sock.as_raw_fd(),
            &iovs,
            if fds.is_empty() { &[] } else { &cmsgs },
            MsgFlags::MSG_NOSIGNAL,
            None,
        );
        return match r {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => Err(tag!("Short write of record: {} of {} bytes", n, data.len())),
            Err(Errno::EINTR) => continue,
            Err(x) => Err(tag!("Failed to send record: {}", x)),
        };
    }
}

pub fn send_client_data(sock: &OwnedFd, data: &ClientData) -> Result<(), String> {
    send_record(sock, &data.encode(), &[])
}

/** Send a TEXTURE record, with `fds` carrying the planes in order */
pub fn send_texture(
    sock: &OwnedFd,
    data: &TextureData,
    fds: &[BorrowedFd<'_>],
) -> Result<(), String> {
    if fds.is_empty() || fds.len() > MAX_PLANES || fds.len() != data.nfd as usize {
        return Err(tag!(
            "Invalid plane count: nfd={} with {} fds",
            data.nfd,
            fds.len()
        ));
    }
    let mut raw_fds: [RawFd; MAX_PLANES] = [-1; MAX_PLANES];
    for (r, f) in raw_fds.iter_mut().zip(fds.iter()) {
        *r = f.as_raw_fd();
    }
    send_record(sock, &data.encode(), &raw_fds[..fds.len()])
}

pub fn send_control(sock: &OwnedFd, data: &ControlData) -> Result<(), String> {
    send_record(sock, &data.encode(), &[])
}

/** Read one CLIENT or TEXTURE record.
 *
 * Returns `Ok(None)` when no data is available. All fds received with an
 * invalid record are closed before returning the error. */
pub fn recv_client_record(sock: &OwnedFd) -> Result<Option<ClientRecord>, RecvError> {
    let mut buf = [0u8; TEXTURE_DATA_SIZE];
    let mut fds: Vec<OwnedFd> = Vec::new();
    let mut truncated = false;
    let mut bad_fd = false;

    let mut iovs = [IoSliceMut::new(&mut buf)];
    /* more space than needed, so that oversized fd lists are detected */
    let mut cmsg_fds = nix::cmsg_space!([RawFd; 32]);
    let r = socket::recvmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &mut iovs,
        Some(&mut cmsg_fds),
        MsgFlags::MSG_CMSG_CLOEXEC,
    );
    let nbytes = match r {
        Ok(resp) => {
            truncated = resp.flags.contains(MsgFlags::MSG_CTRUNC);
            if let Ok(cmsgs) = resp.cmsgs() {
                for msg in cmsgs {
                    if let ControlMessageOwned::ScmRights(tfds) = msg {
                        for f in &tfds {
                            if *f == -1 {
                                bad_fd = true;
                                continue;
                            }
                            fds.push(unsafe {
                                // SAFETY: fd was just created, checked valid, and is recorded nowhere else
                                OwnedFd::from_raw_fd(*f)
                            });
                        }
                    }
                }
            } else {
                truncated = true;
            }
            resp.bytes
        }
        Err(Errno::ECONNRESET) => return Err(RecvError::Closed),
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(None),
        Err(x) => return Err(RecvError::Io(tag!("Error reading from socket: {:?}", x))),
    };

    if nbytes == 0 && fds.is_empty() {
        return Err(RecvError::Closed);
    }
    if truncated || bad_fd {
        return Err(RecvError::Protocol(tag!(
            "Received too many file descriptors ({} kept)",
            fds.len()
        )));
    }
    match buf[0] {
        CLIENT_DATA_TYPE => {
            if nbytes != CLIENT_DATA_SIZE {
                return Err(RecvError::Protocol(tag!(
                    "Client record has length {}, expected {}",
                    nbytes,
                    CLIENT_DATA_SIZE
                )));
            }
            if !fds.is_empty() {
                return Err(RecvError::Protocol(tag!(
                    "Client record carried {} file descriptors",
                    fds.len()
                )));
            }
            Ok(Some(ClientRecord::Client(ClientData::decode(&buf))))
        }
        TEXTURE_DATA_TYPE => {
            if nbytes != TEXTURE_DATA_SIZE {
                return Err(RecvError::Protocol(tag!(
                    "Texture record has length {}, expected {}",
                    nbytes,
                    TEXTURE_DATA_SIZE
                )));
            }
            let data = TextureData::decode(&buf);
            if data.nfd == 0 || data.nfd as usize > MAX_PLANES || fds.len() != data.nfd as usize
            {
                return Err(RecvError::Protocol(tag!(
                    "Texture record declares nfd={} but carried {} file descriptors",
                    data.nfd,
                    fds.len()
                )));
            }
            Ok(Some(ClientRecord::Texture(data, fds)))
        }
        t => Err(RecvError::Protocol(tag!(
            "Unknown record type {} of length {}",
            t,
            nbytes
        ))),
    }
}

/** Read one control record; returns `Ok(None)` when none is pending */
pub fn recv_control(sock: &OwnedFd) -> Result<Option<ControlData>, RecvError> {
    let mut buf = [0u8; CONTROL_DATA_SIZE];
    loop {
        return match socket::recv(sock.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(0) => Err(RecvError::Closed),
            Ok(CONTROL_DATA_SIZE) => Ok(Some(ControlData::decode(&buf))),
            Ok(n) => Err(RecvError::Protocol(tag!(
                "Control record has length {}, expected {}",
                n,
                CONTROL_DATA_SIZE
            ))),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => Ok(None),
            Err(Errno::ECONNRESET) => Err(RecvError::Closed),
            Err(x) => Err(RecvError::Io(tag!("Error reading from socket: {:?}", x))),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::*;
    use std::os::fd::AsFd;

    #[test]
    fn client_record_roundtrip() {
        let (a, b) = socket_pair();
        send_client_data(
            &a,
            &ClientData {
                exe: "gamebin".into(),
            },
        )
        .unwrap();
        match recv_client_record(&b).unwrap() {
            Some(ClientRecord::Client(c)) => assert_eq!(c.exe, "gamebin"),
            x => panic!("unexpected {:?}", x),
        }
        assert!(recv_client_record(&b).unwrap().is_none());
    }

    #[test]
    fn client_record_name_truncated() {
        let exe: String = "x".repeat(60);
        let buf = ClientData { exe }.encode();
        assert_eq!(buf[0], CLIENT_DATA_TYPE);
        assert_eq!(buf[EXE_NAME_LEN], 0);
        assert_eq!(ClientData::decode(&buf).exe.len(), EXE_NAME_LEN - 1);
    }

    #[test]
    fn texture_record_layout() {
        let t = TextureData {
            nfd: 1,
            width: 1920,
            height: 1080,
            format: 0x34325241,
            strides: [7680, 0, 0, 0],
            offsets: [0; 4],
            modifier: 0x0200_0000_0000_2000,
            winid: 0x1234,
            flip: true,
            color_space: 0,
        };
        let buf = t.encode();
        assert_eq!(buf[0], 11);
        assert_eq!(&buf[12..16], b"AR24");
        assert_eq!(&buf[16..20], &7680i32.to_le_bytes());
        assert_eq!(TextureData::decode(&buf), t);
    }

    #[test]
    fn texture_multiplane_fds() {
        let (a, b) = socket_pair();
        let pipes: Vec<(OwnedFd, OwnedFd)> = (0..3).map(|_| nonblocking_pipe()).collect();
        let t = TextureData {
            nfd: 3,
            width: 640,
            height: 480,
            format: 0x3231564e,
            strides: [640, 320, 320, 0],
            offsets: [0, 307200, 384000, 0],
            modifier: 0,
            winid: 7,
            flip: false,
            color_space: 0,
        };
        let fds: Vec<BorrowedFd> = pipes.iter().map(|p| p.1.as_fd()).collect();
        send_texture(&a, &t, &fds).unwrap();
        match recv_client_record(&b).unwrap() {
            Some(ClientRecord::Texture(d, fds)) => {
                assert_eq!(d, t);
                assert_eq!(fds.len(), 3);
            }
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn texture_extra_fds_rejected() {
        let (a, b) = socket_pair();
        let pipes: Vec<(OwnedFd, OwnedFd)> = (0..5).map(|_| nonblocking_pipe()).collect();
        let t = TextureData {
            nfd: 4,
            width: 16,
            height: 16,
            format: 0x34325241,
            ..TextureData::default()
        };
        let raw: Vec<RawFd> = pipes.iter().map(|p| p.1.as_raw_fd()).collect();
        send_record(&a, &t.encode(), &raw).unwrap();
        let (readers, writers): (Vec<OwnedFd>, Vec<OwnedFd>) = pipes.into_iter().unzip();
        drop(writers);
        match recv_client_record(&b) {
            Err(RecvError::Protocol(_)) => (),
            x => panic!("unexpected {:?}", x),
        }
        /* every received write end was closed again */
        for r in readers.iter() {
            assert!(pipe_writers_closed(r));
        }
    }

    #[test]
    fn texture_nfd_mismatch_rejected() {
        let (a, b) = socket_pair();
        let (r, w) = nonblocking_pipe();
        let t = TextureData {
            nfd: 2,
            ..TextureData::default()
        };
        send_record(&a, &t.encode(), &[w.as_raw_fd()]).unwrap();
        drop(w);
        assert!(matches!(recv_client_record(&b), Err(RecvError::Protocol(_))));
        assert!(pipe_writers_closed(&r));

        assert!(send_texture(&a, &t, &[r.as_fd()]).is_err());
    }

    #[test]
    fn short_record_rejected() {
        let (a, b) = socket_pair();
        let mut short = [0u8; 64];
        short[0] = TEXTURE_DATA_TYPE;
        send_record(&a, &short, &[]).unwrap();
        assert!(matches!(recv_client_record(&b), Err(RecvError::Protocol(_))));

        let mut unknown = [0u8; 128];
        unknown[0] = 3;
        send_record(&a, &unknown, &[]).unwrap();
        assert!(matches!(recv_client_record(&b), Err(RecvError::Protocol(_))));
    }

    #[test]
    fn eof_is_closed() {
        let (a, b) = socket_pair();
        drop(a);
        assert!(matches!(recv_client_record(&b), Err(RecvError::Closed)));
        assert!(matches!(recv_control(&b), Err(RecvError::Closed)));
    }

    #[test]
    fn control_roundtrip() {
        let (a, b) = socket_pair();
        assert!(recv_control(&b).unwrap().is_none());
        let c = ControlData {
            capturing: true,
            hints: AllocHints {
                no_modifiers: true,
                linear: false,
                map_host: false,
            },
            device_uuid: [9; 16],
        };
        let buf = c.encode();
        assert_eq!(&buf[..4], &[1, 1, 0, 0]);
        send_control(&a, &c).unwrap();
        assert_eq!(recv_control(&b).unwrap(), Some(c));
    }
}
