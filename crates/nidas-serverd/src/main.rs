// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! nidas-serverd - NIDAS central server daemon.
//!
//! Accepts DSM connections via multicast rendezvous, merges every DSM's
//! sample stream through one [`nidas::SampleSorter`], and fans the
//! combined, time-ordered stream out to an archive [`nidas::transport::FileSet`]
//! (§6 CLI surface).
//!
//! Usage:
//!   nidas-serverd -c /data/archive
//!   nidas-serverd -d -v -l /var/log/nidas/serverd.log

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use parking_lot::Mutex;

use nidas::config::{RENDEZVOUS_GROUP, RENDEZVOUS_PORT};
use nidas::sample::Sample;
use nidas::source::SampleClient;
use nidas::transport::{
    BackpressurePolicy, ConnectionRequester, FileSet, InputStream, McSocket, McSocketAccepter, McSocketRole,
    OutputStream, RolloverTrigger, SocketConfig, StreamHeader,
};
use nidas::{RuntimeConfig, SamplePool, SampleSorter};

/// NIDAS server daemon
#[derive(Parser, Debug)]
#[command(name = "nidas-serverd")]
#[command(version)]
#[command(about = "NIDAS server daemon: accepts DSM connections, sorts, and archives the sample stream")]
struct Args {
    /// Run in foreground with debug output
    #[arg(short = 'd', long)]
    debug: bool,

    /// Log file path (default: stderr)
    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,

    /// Drop privileges to this user after opening the listen socket
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Configuration URL; here, the archive directory to write into
    #[arg(short = 'c', long = "config", default_value = "./archive")]
    config_url: PathBuf,

    /// Real-time scheduling priority (nice-value style, platform-dependent)
    #[arg(short = 'r', long = "realtime-priority")]
    realtime_priority: Option<i32>,

    /// Verbose logging (may be repeated)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn exit_code_for(result: &anyhow::Result<bool>) -> ExitCode {
    match result {
        Ok(true) => ExitCode::from(3),
        Ok(false) => ExitCode::SUCCESS,
        Err(_) => ExitCode::from(2),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("configuration error: {e}");
        return ExitCode::from(1);
    }

    if let Some(user) = &args.user {
        if let Err(e) = drop_privileges(user) {
            error!("failed to drop privileges to '{user}': {e}");
            return ExitCode::from(1);
        }
    }

    if let Some(priority) = args.realtime_priority {
        apply_priority(priority);
    }

    let result = run(&args);
    match &result {
        Ok(true) => info!("nidas-serverd exiting: interrupted"),
        Ok(false) => info!("nidas-serverd exiting: normal shutdown"),
        Err(e) => error!("nidas-serverd exiting: fatal error: {e}"),
    }
    exit_code_for(&result)
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.verbose {
        0 if args.debug => log::LevelFilter::Debug,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    if let Some(path) = &args.logfile {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("cannot open log file {}: {e}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn drop_privileges(user: &str) -> anyhow::Result<()> {
    let cname = std::ffi::CString::new(user)?;
    // SAFETY: getpwnam returns either null or a pointer to a static/
    // thread-local libc-owned passwd struct; we only read it before any
    // further libc call that could invalidate it.
    let passwd = unsafe { libc::getpwnam(cname.as_ptr()) };
    if passwd.is_null() {
        anyhow::bail!("unknown user '{user}'");
    }
    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };

    let rc = unsafe { libc::setgid(gid) };
    if rc != 0 {
        anyhow::bail!("setgid({gid}) failed: {}", std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::setuid(uid) };
    if rc != 0 {
        anyhow::bail!("setuid({uid}) failed: {}", std::io::Error::last_os_error());
    }
    info!("dropped privileges to user '{user}' (uid={uid}, gid={gid})");
    Ok(())
}

fn apply_priority(priority: i32) {
    // SAFETY: setpriority with PRIO_PROCESS and pid 0 (this process) is a
    // plain libc call with no pointer arguments.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
    if rc != 0 {
        warn!(
            "failed to set realtime priority {priority}: {}",
            std::io::Error::last_os_error()
        );
    } else {
        info!("process priority set to {priority}");
    }
}

/// Forwards sorted samples into the archive's framed output stream. The
/// `OutputStream` itself isn't `Sync`, so writes are serialized behind a
/// `Mutex` -- acceptable here since the sorter delivers from a single
/// worker thread.
struct ArchiveClient {
    out: Mutex<OutputStream<FileSet>>,
}

impl SampleClient for ArchiveClient {
    fn receive(&self, sample: &Sample) -> bool {
        match self.out.lock().write_sample(sample) {
            Ok(()) => true,
            Err(e) => {
                warn!("archive write failed: {e}");
                false
            }
        }
    }

    fn flush(&self) {}
}

struct NoopRequester;
impl ConnectionRequester for NoopRequester {}

/// Runs the accept loop until `shutdown` fires, handing each DSM connection
/// off to its own reader thread that feeds `sorter`. Returns the reader
/// threads' handles so the caller can join them before reclaiming `sorter`.
fn accept_loop(
    sorter: Arc<SampleSorter>,
    pool: Arc<SamplePool>,
    shutdown: Arc<AtomicBool>,
) -> Vec<std::thread::JoinHandle<()>> {
    let accepter = McSocketAccepter::new(RENDEZVOUS_GROUP, RENDEZVOUS_PORT);
    let mut readers = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match accepter.rendezvous(&shutdown) {
            Ok(stream) => {
                let sorter = Arc::clone(&sorter);
                let pool = Arc::clone(&pool);
                let shutdown = Arc::clone(&shutdown);
                readers.push(std::thread::spawn(move || {
                    if let Err(e) = service_connection(stream, sorter, pool, &shutdown) {
                        warn!("dsm connection ended: {e}");
                    }
                }));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => break,
            Err(e) => {
                warn!("rendezvous accept failed: {e}");
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }
    readers
}

fn service_connection(
    stream: std::net::TcpStream,
    sorter: Arc<SampleSorter>,
    pool: Arc<SamplePool>,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    let channel = McSocket::from_stream(
        stream,
        RENDEZVOUS_GROUP,
        RENDEZVOUS_PORT,
        McSocketRole::Accepter,
        SocketConfig::default(),
    )?;
    let mut input = InputStream::new(channel, pool);
    let header = input.ensure_header()?;
    info!("dsm connected: project={:?}", header.get("project"));

    while !shutdown.load(Ordering::SeqCst) {
        match input.read_sample() {
            Ok(sample) => {
                sorter.receive(sample);
            }
            Err(e) => {
                info!("dsm stream closed: {e}");
                break;
            }
        }
    }
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<bool> {
    let config = RuntimeConfig::default();
    info!("nidas-serverd starting (archive dir={})", args.config_url.display());

    let shutdown = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| anyhow::anyhow!("failed to install signal handler: {e}"))?;
    }

    let pool = Arc::new(SamplePool::new());
    let mut sorter = SampleSorter::new(config.sorter_lag, config.sorter_memory_budget_bytes);

    let archive_channel = FileSet::new(&args.config_url, "nidas", "dat", RolloverTrigger::Size(256 * 1024 * 1024));
    let mut archive_header = StreamHeader::new();
    archive_header.set("software-version", env!("CARGO_PKG_VERSION"));
    let mut archive_out = OutputStream::new(archive_channel, archive_header, config.reconnect_buffer_bytes, BackpressurePolicy::Block);
    archive_out
        .connect(&NoopRequester)
        .map_err(|e| anyhow::anyhow!("failed to open archive at {}: {e}", args.config_url.display()))?;
    let archive_client = Arc::new(ArchiveClient {
        out: Mutex::new(archive_out),
    });
    sorter.add_downstream(archive_client);

    let sorter = Arc::new(sorter);
    let readers = accept_loop(Arc::clone(&sorter), pool, Arc::clone(&shutdown));
    for reader in readers {
        let _ = reader.join();
    }

    match Arc::try_unwrap(sorter) {
        Ok(mut sorter) => sorter.shutdown(),
        Err(_) => warn!("sorter still has outstanding references after joining all reader threads"),
    }

    Ok(interrupted.load(Ordering::SeqCst))
}
