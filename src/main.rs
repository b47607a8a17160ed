//! dectcap - DECT sniffer command line interface
//!
//! Drives a com-on-air sniffer card: scans for basestations and active
//! calls, synchronizes on a call by RFPI and dumps its traffic to pcap,
//! with optional wav/ima audio dumps. Commands are read line by line from
//! stdin; `help` lists them.

mod audio;
mod capture;
mod device;
mod engine;
mod rfpi;
mod station;
mod storage;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use device::CoaDevice;
use engine::Engine;
use storage::Storage;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Event-loop tick in milliseconds; drives the hopper and autorec policy.
const TICK_MS: i32 = 1000;

fn main() -> Result<()> {
    // Log to stderr — stdout belongs to the operator dialogue.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dectcap=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    tracing::info!("Starting dectcap v{}", VERSION);

    let storage = Storage::new()?;
    let config = storage.config.clone();

    let coa = CoaDevice::open(&config.device_path)
        .with_context(|| format!("couldn't open sniffer device {:?}", config.device_path))?;
    let dev_fd = coa.as_raw_fd();

    // SIGINT/SIGTERM land here; the loop notices the flag within one tick
    // and runs the same shutdown as `quit`. SIGKILL cannot be caught.
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::Relaxed);
        })
        .context("couldn't install signal handler")?;
    }

    let mut engine = Engine::new(coa, &config, None, Utc::now());

    println!("DECT command line interface");
    println!("type \"help\" if you're lost");
    if !atty::is(atty::Stream::Stdin) {
        tracing::info!("stdin is not a terminal; reading commands from a pipe");
    }

    let res = run(&mut engine, dev_fd, &running);

    // Every exit path — quit, signal, fatal error — flushes dumps and
    // prints the final station report exactly once.
    engine.shutdown();

    if let Err(err) = res {
        eprintln!("Error: {err:?}");
        return Err(err);
    }

    Ok(())
}

/// Accumulates raw stdin bytes and hands back one command line at a time.
/// poll(2) only reports fd readiness; a multi-line paste arrives in one
/// readable event, so lines past the first must be remembered here and
/// served before the next poll is allowed to sleep.
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// A complete line is waiting; the event loop must not block on poll.
    fn has_line(&self) -> bool {
        self.pending.contains(&b'\n')
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Remaining unterminated bytes, for the final command before EOF.
    fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// The event loop: poll stdin and the device fd with a 1 s timeout, drain
/// whichever is ready, dispatch at most one command, then re-evaluate
/// hopping and autorec. Returns Ok on `quit`/EOF/signal; any Err is fatal
/// and the caller shuts down.
fn run(engine: &mut Engine<CoaDevice>, dev_fd: i32, running: &AtomicBool) -> Result<()> {
    let stdin_fd = libc::STDIN_FILENO;
    let mut lines = LineBuffer::new();

    loop {
        if !running.load(Ordering::Relaxed) {
            println!("### got signal, will dump & quit");
            return Ok(());
        }

        let mut fds = [
            libc::pollfd {
                fd: stdin_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: dev_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // A buffered command line counts as ready input: poll must not
        // sleep a full tick on it.
        let timeout = if lines.has_line() { 0 } else { TICK_MS };

        // SAFETY: fds points at a live array of 2 pollfds.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue; // signal; the flag check above handles it
            }
            return Err(err).context("poll failed");
        }

        let now = Utc::now();

        let bad = libc::POLLERR | libc::POLLNVAL;
        if fds[1].revents & (bad | libc::POLLHUP) != 0 {
            bail!("device error condition on poll");
        }
        if fds[0].revents & bad != 0 {
            bail!("stdin error condition on poll");
        }

        if fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            let mut chunk = [0u8; 4096];
            // SAFETY: chunk is a live buffer of the stated length.
            let n = unsafe { libc::read(stdin_fd, chunk.as_mut_ptr().cast(), chunk.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err).context("read from stdin failed");
                }
            } else if n == 0 {
                // EOF behaves like quit, after any unterminated last command
                if let Some(line) = lines.take_rest() {
                    engine.handle_command(&line, now)?;
                }
                return Ok(());
            } else {
                lines.push(&chunk[..n as usize]);
            }
        }

        // One command per iteration; anything still buffered keeps the
        // next poll from sleeping.
        if let Some(line) = lines.next_line() {
            engine.handle_command(&line, now)?;
            if engine.quit_requested() {
                return Ok(());
            }
        }

        if fds[1].revents & libc::POLLIN != 0 {
            engine.drain_device(now)?;
        }

        engine.tick(now)?;
    }
}
