//! Sandbox processes and the message streams to them.
//!
//! A [`SandboxLauncher`] turns a [`LaunchSpec`] into a [`SandboxHandle`]: a
//! sink the owning process writes frames to, and an event channel fed by a
//! reader thread. The channel yields [`SandboxEvent::Closed`] exactly once,
//! when the stream ends for any reason.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use cvm_protocol::{read_frame, write_frame, DockerVmMessage};
use tracing::{debug, warn};

use crate::config::{SchedulerConfig, Transport};
use crate::reaper;
use crate::types::{ContractKey, ProcessName};
use crate::user::SandboxUser;

pub const ENV_SANDBOX_SOCK_PATH: &str = "CVM_SANDBOX_SOCK_PATH";
pub const ENV_SANDBOX_ADDR: &str = "CVM_SANDBOX_ADDR";
pub const ENV_SANDBOX_PROCESS_NAME: &str = "CVM_SANDBOX_PROCESS_NAME";
pub const ENV_SANDBOX_MOUNT_DIR: &str = "CVM_SANDBOX_MOUNT_DIR";

const STDERR_TAIL_BYTES: usize = 4 * 1024;

#[derive(Debug)]
pub enum SandboxEvent {
    Message(DockerVmMessage),
    /// Stream ended; carries crash detail when there is any.
    Closed(Option<String>),
}

pub trait MessageSink: Send {
    fn send(&mut self, msg: &DockerVmMessage) -> anyhow::Result<()>;
    fn shutdown(&mut self);
}

pub struct SandboxHandle {
    pub sink: Box<dyn MessageSink>,
    pub events: mpsc::Receiver<SandboxEvent>,
    pub child: Option<Child>,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("child", &self.child.as_ref().map(Child::id))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub process_name: ProcessName,
    pub key: ContractKey,
    pub contract_path: PathBuf,
    pub user: SandboxUser,
}

pub trait SandboxLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<SandboxHandle>;
}

/// A connected stream over either transport.
pub enum Conn {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Conn {
    pub fn try_clone(&self) -> io::Result<Conn> {
        match self {
            Conn::Unix(s) => s.try_clone().map(Conn::Unix),
            Conn::Tcp(s) => s.try_clone().map(Conn::Tcp),
        }
    }

    pub fn shutdown(&self) {
        let _ = match self {
            Conn::Unix(s) => s.shutdown(Shutdown::Both),
            Conn::Tcp(s) => s.shutdown(Shutdown::Both),
        };
    }

    fn set_nonblocking(&self, v: bool) -> io::Result<()> {
        match self {
            Conn::Unix(s) => s.set_nonblocking(v),
            Conn::Tcp(s) => s.set_nonblocking(v),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Unix(s) => s.read(buf),
            Conn::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Unix(s) => s.write(buf),
            Conn::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Unix(s) => s.flush(),
            Conn::Tcp(s) => s.flush(),
        }
    }
}

struct ConnSink {
    conn: Conn,
}

impl MessageSink for ConnSink {
    fn send(&mut self, msg: &DockerVmMessage) -> anyhow::Result<()> {
        write_frame(&mut self.conn, msg).context("write frame to sandbox")
    }

    fn shutdown(&mut self) {
        self.conn.shutdown();
    }
}

enum Listener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl Listener {
    fn accept(&self) -> io::Result<Conn> {
        match self {
            Listener::Unix(l, _) => l.accept().map(|(s, _)| Conn::Unix(s)),
            Listener::Tcp(l) => l.accept().map(|(s, _)| Conn::Tcp(s)),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Spawns the configured sandbox binary, one OS process per [`LaunchSpec`].
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    bin: PathBuf,
    args: Vec<String>,
    mount_dir: PathBuf,
    transport: Transport,
    start_timeout: Duration,
}

impl CommandLauncher {
    pub fn new(cfg: &SchedulerConfig) -> Self {
        CommandLauncher {
            bin: cfg.sandbox.bin.clone(),
            args: cfg.sandbox.args.clone(),
            mount_dir: cfg.sandbox.mount_dir.clone(),
            transport: cfg.chain.transport,
            start_timeout: cfg.sandbox_start_timeout(),
        }
    }

    fn bind(&self, spec: &LaunchSpec) -> anyhow::Result<(Listener, String)> {
        match self.transport {
            Transport::Uds => {
                let path = spec.user.sock_path.clone();
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("create sock dir: {}", dir.display()))?;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("remove stale socket: {}", path.display()))
                    }
                }
                let l = UnixListener::bind(&path)
                    .with_context(|| format!("bind sandbox socket: {}", path.display()))?;
                chown_for_user(&path, &spec.user)?;
                l.set_nonblocking(true).context("set listener nonblocking")?;
                Ok((Listener::Unix(l, path.clone()), path.display().to_string()))
            }
            Transport::Tcp => {
                let l = TcpListener::bind("127.0.0.1:0").context("bind sandbox tcp listener")?;
                l.set_nonblocking(true).context("set listener nonblocking")?;
                let addr = l.local_addr().context("sandbox listener addr")?.to_string();
                Ok((Listener::Tcp(l), addr))
            }
        }
    }

    fn spawn(&self, spec: &LaunchSpec, endpoint: &str) -> anyhow::Result<Child> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args)
            .env(ENV_SANDBOX_PROCESS_NAME, spec.process_name.to_string())
            .env(ENV_SANDBOX_MOUNT_DIR, &self.mount_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        match self.transport {
            Transport::Uds => cmd.env(ENV_SANDBOX_SOCK_PATH, endpoint),
            Transport::Tcp => cmd.env(ENV_SANDBOX_ADDR, endpoint),
        };

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            if unsafe { libc::geteuid() } == 0 {
                cmd.uid(spec.user.uid).gid(spec.user.gid);
            }
            // Own group, so termination reaches whatever the sandbox forks.
            cmd.process_group(0);
        }

        cmd.spawn()
            .with_context(|| format!("spawn sandbox {}", self.bin.display()))
    }

    fn accept(&self, listener: &Listener, child: &mut Child, tail: &StderrTail) -> anyhow::Result<Conn> {
        let deadline = Instant::now() + self.start_timeout;
        loop {
            match listener.accept() {
                Ok(conn) => {
                    conn.set_nonblocking(false)
                        .context("set sandbox stream blocking")?;
                    return Ok(conn);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err).context("accept sandbox connection"),
            }
            if let Some(status) = child.try_wait().context("poll sandbox child")? {
                // Let the stderr pump catch up before reporting.
                thread::sleep(Duration::from_millis(20));
                anyhow::bail!(
                    "sandbox exited before connecting ({status}): {}",
                    tail.snapshot().unwrap_or_default()
                );
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "sandbox did not connect within {}ms",
                    self.start_timeout.as_millis()
                );
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl SandboxLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<SandboxHandle> {
        let (listener, endpoint) = self.bind(spec)?;
        let mut child = self.spawn(spec, &endpoint)?;
        let tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            tail.pump(stderr, &spec.process_name);
        }

        let conn = match self.accept(&listener, &mut child, &tail) {
            Ok(conn) => conn,
            Err(err) => {
                reaper::terminate(&spec.process_name, child);
                return Err(err);
            }
        };
        drop(listener);

        let (tx, rx) = mpsc::channel();
        let started = conn
            .try_clone()
            .context("clone sandbox stream")
            .and_then(|reader| spawn_reader(&spec.process_name, reader, tx, Some(tail)));
        if let Err(err) = started {
            reaper::terminate(&spec.process_name, child);
            return Err(err);
        }
        debug!(process = %spec.process_name, pid = child.id(), "sandbox connected");
        Ok(SandboxHandle {
            sink: Box::new(ConnSink { conn }),
            events: rx,
            child: Some(child),
        })
    }
}

#[cfg(unix)]
fn chown_for_user(path: &std::path::Path, user: &SandboxUser) -> anyhow::Result<()> {
    use std::os::unix::ffi::OsStrExt as _;
    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .context("socket path contains NUL")?;
    let r = unsafe { libc::chown(c_path.as_ptr(), user.uid, user.gid) };
    if r != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("chown {} to {}", path.display(), user.uid));
    }
    Ok(())
}

#[cfg(not(unix))]
fn chown_for_user(_path: &std::path::Path, _user: &SandboxUser) -> anyhow::Result<()> {
    Ok(())
}

/// Last bytes a sandbox wrote to stderr, for crash reports.
#[derive(Clone, Default)]
struct StderrTail {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl StderrTail {
    fn pump(&self, mut stderr: impl Read + Send + 'static, name: &ProcessName) {
        let buf = Arc::clone(&self.buf);
        let _ = thread::Builder::new()
            .name(format!("cvm-stderr-{}", name.overall_index))
            .spawn(move || {
                let mut chunk = [0u8; 1024];
                loop {
                    match stderr.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut g = buf.lock().unwrap_or_else(|e| e.into_inner());
                            g.extend_from_slice(&chunk[..n]);
                            if g.len() > STDERR_TAIL_BYTES {
                                let cut = g.len() - STDERR_TAIL_BYTES;
                                g.drain(..cut);
                            }
                        }
                    }
                }
            });
    }

    fn snapshot(&self) -> Option<String> {
        let g = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let s = String::from_utf8_lossy(&g).trim().to_string();
        (!s.is_empty()).then_some(s)
    }
}

fn spawn_reader(
    name: &ProcessName,
    mut reader: impl Read + Send + 'static,
    tx: mpsc::Sender<SandboxEvent>,
    tail: Option<StderrTail>,
) -> anyhow::Result<()> {
    let label = name.to_string();
    thread::Builder::new()
        .name(format!("cvm-sandbox-rx-{}", name.overall_index))
        .spawn(move || {
            let detail = loop {
                match read_frame(&mut reader) {
                    Ok(Some(msg)) => {
                        if tx.send(SandboxEvent::Message(msg)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break None,
                    Err(err) => {
                        warn!(process = %label, error = %err, "sandbox stream failed");
                        break Some(err.to_string());
                    }
                }
            };
            // Give a crashing child a moment to flush stderr.
            thread::sleep(Duration::from_millis(20));
            let detail = tail.and_then(|t| t.snapshot()).or(detail);
            let _ = tx.send(SandboxEvent::Closed(detail));
        })
        .context("spawn sandbox reader thread")?;
    Ok(())
}

/// In-process stream pair for launchers that drive the sandbox end from a
/// thread; returns the handle for the manager side and the far end.
pub fn stream_pair(name: &ProcessName) -> anyhow::Result<(SandboxHandle, UnixStream)> {
    let (ours, theirs) = UnixStream::pair().context("create sandbox stream pair")?;
    let reader = ours.try_clone().context("clone sandbox stream")?;
    let (tx, rx) = mpsc::channel();
    spawn_reader(name, reader, tx, None)?;
    Ok((
        SandboxHandle {
            sink: Box::new(ConnSink {
                conn: Conn::Unix(ours),
            }),
            events: rx,
            child: None,
        },
        theirs,
    ))
}
