/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! `vkcapture-server`: a standalone capture consumer.
 *
 * Listens for capture clients, shows (imports) the texture of the one that
 * matches the command line selection, and reports what it receives. This is
 * what a compositor or streaming host would embed; run on its own it is a
 * way to check that games are being captured. */
use clap::{value_parser, Arg, ArgAction, Command};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::{signal, time};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use vkcapture::formats::drm_format_name;
use vkcapture::import::VulkanImporter;
use vkcapture::server::{ClientInfo, Consumer, ConsumerSettings, Options, Server, TextureBackend};
use vkcapture::tag;

/** Interval between consumer ticks */
const FRAME_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 60);

/** For SIGINT handler; is set to true after SIGINT was received */
static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

/** Handler to record whether SIGINT was received */
extern "C" fn sigint_handler(_signo: i32) {
    SIGINT_RECEIVED.store(true, Ordering::Release);
}

/** Setup a SIGINT handler, and return a modified poll mask in which SIGINT is not blocked. */
fn setup_sigint_handler() -> Result<signal::SigSet, String> {
    /* Block SIGINT outside of ppoll, so it cannot arrive between the check
     * and the wait. Threads spawned later inherit the mask. */
    let mut mask = signal::SigSet::empty();
    mask.add(signal::SIGINT);
    let mut pollmask = mask
        .thread_swap_mask(signal::SigmaskHow::SIG_BLOCK)
        .map_err(|x| tag!("Failed to set sigmask: {}", x))?;
    pollmask.remove(signal::SIGINT);

    let sigaction = signal::SigAction::new(
        signal::SigHandler::Handler(sigint_handler),
        signal::SaFlags::SA_NOCLDSTOP,
        signal::SigSet::empty(),
    );
    unsafe {
        // SAFETY: called once, before any other handler is installed;
        // sigint_handler only stores to an atomic
        signal::sigaction(signal::Signal::SIGINT, &sigaction)
            .map_err(|x| tag!("Failed to set sigaction: {}", x))?;
    }
    Ok(pollmask)
}

/** Sleep until `deadline` or until SIGINT arrives */
fn wait_until(deadline: Instant, pollmask: &signal::SigSet) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }
    let timeout = time::TimeSpec::from_duration(deadline - now);
    match nix::poll::ppoll(&mut [], Some(timeout), Some(*pollmask)) {
        Ok(_) | Err(Errno::EINTR) | Err(Errno::EAGAIN) => (),
        Err(x) => debug!("ppoll failed: {}", x),
    }
}

fn describe_client(c: &ClientInfo) -> String {
    format!(
        "{} pid {} '{}'",
        c.id,
        c.pid.map(|x| x.to_string()).unwrap_or("?".into()),
        c.exe.as_deref().unwrap_or("")
    )
}

fn build_command() -> Command {
    Command::new(env!("CARGO_BIN_NAME"))
        .about(
            "Receive captured game frames from the obs-vkcapture Vulkan layer\n\
             and GL library, and import them on the local GPU",
        )
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("window")
                .short('w')
                .long("window")
                .value_name("exe")
                .help("Capture only the application with this executable name")
                .value_parser(value_parser!(String)),
        )
        .arg(
            Arg::new("exclude")
                .short('x')
                .long("exclude")
                .help("Capture any application except the one given by --window")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("secs")
                .help("Give up on a client that sends no texture this long after activation")
                .value_parser(value_parser!(u32))
                .default_value("5"),
        )
        .arg(
            Arg::new("no-transparency")
                .long("no-transparency")
                .help("Treat every captured image as opaque")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("socket")
                .long("socket")
                .value_name("name")
                .hide(true)
                .help("Test option: abstract socket name to listen on")
                .value_parser(value_parser!(String)),
        )
        .arg(
            Arg::new("frames")
                .long("frames")
                .value_name("n")
                .hide(true)
                .help("Test option: exit after this many texture updates")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Print debug messages")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("trace")
                .long("trace")
                .action(ArgAction::SetTrue)
                .help("Test option: print trace level messages")
                .hide(true),
        )
}

fn main() -> Result<(), String> {
    let matches = build_command().get_matches();

    let debug = matches.get_flag("debug");
    let trace = matches.get_flag("trace");
    let max_level = if trace {
        log::LevelFilter::Trace
    } else if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Error
    };
    vkcapture::logger::init("vkcapture-server", max_level);

    let settings = ConsumerSettings {
        window: matches
            .get_one::<String>("window")
            .cloned()
            .unwrap_or_default(),
        exclude: matches.get_flag("exclude"),
        show_cursor: false,
        allow_transparency: !matches.get_flag("no-transparency"),
    };
    let mut options = Options::default();
    if let Some(timeout) = matches.get_one::<u32>("timeout") {
        options.activation_timeout = Duration::from_secs(u64::from(*timeout));
    }
    if let Some(name) = matches.get_one::<String>("socket") {
        options.socket_name = name.clone();
    }
    let max_updates: Option<u64> = matches.get_one::<u64>("frames").copied();

    let pollmask = setup_sigint_handler()?;

    let mut backend = VulkanImporter::new()?;
    info!("Importing on {}", backend.device_name());
    let mut server = Server::start(options, backend.device_uuid())?;
    let mut consumer: Consumer<VulkanImporter> = Consumer::new(&server, settings);

    let mut known: Vec<ClientInfo> = Vec::new();
    let mut frames: u64 = 0;
    let mut updates: u64 = 0;
    let mut next = Instant::now();
    while !SIGINT_RECEIVED.load(Ordering::Acquire) {
        if max_updates.is_some_and(|n| updates >= n) {
            break;
        }

        let clients = server.clients();
        if clients != known {
            for c in clients.iter().filter(|c| !known.contains(c)) {
                info!("Client {}", describe_client(c));
            }
            known = clients;
        }

        if consumer.tick(&mut backend) {
            updates += 1;
            if let Some(t) = consumer.info() {
                info!(
                    "Showing client {}: {}x{} {}{}{}",
                    t.client_id,
                    t.width,
                    t.height,
                    drm_format_name(t.fourcc),
                    if t.flip { ", flipped" } else { "" },
                    if t.host_mapped { ", host mapped" } else { "" }
                );
            }
        }
        if let Err(e) = consumer.render(&mut backend) {
            warn!("Failed to refresh texture: {}", e);
        }

        frames += 1;
        next += FRAME_INTERVAL;
        let now = Instant::now();
        if next < now {
            /* skip frames rather than trying to catch up */
            next = now;
        }
        wait_until(next, &pollmask);
    }

    debug!(
        "Shutting down after {} frames, {} texture updates",
        frames, updates
    );
    drop(consumer);
    server.shutdown();
    if SIGINT_RECEIVED.load(Ordering::Acquire) {
        info!("Interrupted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line() {
        build_command().debug_assert();

        let m = build_command()
            .try_get_matches_from(["vkcapture-server", "-w", "game.exe", "-x", "--timeout", "2"])
            .unwrap();
        assert_eq!(m.get_one::<String>("window").unwrap(), "game.exe");
        assert!(m.get_flag("exclude"));
        assert_eq!(*m.get_one::<u32>("timeout").unwrap(), 2);
        assert!(!m.get_flag("no-transparency"));

        let m = build_command()
            .try_get_matches_from(["vkcapture-server"])
            .unwrap();
        assert!(m.get_one::<String>("window").is_none());
        assert_eq!(*m.get_one::<u32>("timeout").unwrap(), 5);

        assert!(build_command()
            .try_get_matches_from(["vkcapture-server", "--timeout", "soon"])
            .is_err());
    }
}
