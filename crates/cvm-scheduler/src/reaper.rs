//! Termination of sandbox children.
//!
//! A sandbox runs as its own process group. Termination sends SIGTERM to the
//! group and leaves the child with a reaper thread, which escalates to
//! SIGKILL once [`KILL_GRACE`] has passed and collects the exit status so no
//! child is left a zombie.

use std::process::{Child, ExitStatus};
use std::sync::{mpsc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::types::ProcessName;

/// Time a sandbox gets to exit after SIGTERM.
pub(crate) const KILL_GRACE: Duration = Duration::from_millis(500);
const TICK: Duration = Duration::from_millis(50);

static REAPER: OnceLock<mpsc::Sender<Doomed>> = OnceLock::new();

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Delivers `sig` to the group led by `pid`, or to `pid` alone when it leads
/// no group.
fn signal_group(pid: u32, sig: Signal) {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return;
        };
        let sig = match sig {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: signal delivery only; no memory crosses the call.
        unsafe {
            if libc::killpg(pid, sig) == -1 {
                let _ = libc::kill(pid, sig);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, sig);
    }
}

struct Doomed {
    process: String,
    child: Child,
    kill_at: Instant,
    killed: bool,
}

impl Doomed {
    /// `true` once the exit status is collected.
    fn poll(&mut self, now: Instant) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                log_exit(&self.process, self.child.id(), status, self.killed);
                return true;
            }
            Ok(None) => {}
            #[cfg(unix)]
            Err(err) if err.raw_os_error() == Some(libc::ECHILD) => return true,
            Err(err) => {
                warn!(process = %self.process, pid = self.child.id(), error = %err, "poll sandbox exit");
            }
        }
        if !self.killed && now >= self.kill_at {
            warn!(process = %self.process, pid = self.child.id(), "sandbox outlived SIGTERM, killing");
            signal_group(self.child.id(), Signal::Kill);
            self.killed = true;
        }
        false
    }

    fn kill_and_wait(mut self) {
        signal_group(self.child.id(), Signal::Kill);
        match self.child.wait() {
            Ok(status) => log_exit(&self.process, self.child.id(), status, true),
            Err(err) => warn!(process = %self.process, error = %err, "wait for sandbox"),
        }
    }
}

fn log_exit(process: &str, pid: u32, status: ExitStatus, killed: bool) {
    debug!(process, pid, %status, killed, "sandbox reaped");
}

/// Asks the sandbox of `process` to exit and reaps it in the background.
pub(crate) fn terminate(process: &ProcessName, mut child: Child) {
    if let Ok(Some(status)) = child.try_wait() {
        log_exit(&process.to_string(), child.id(), status, false);
        return;
    }
    signal_group(child.id(), Signal::Term);
    let doomed = Doomed {
        process: process.to_string(),
        child,
        kill_at: Instant::now() + KILL_GRACE,
        killed: false,
    };
    let tx = REAPER.get_or_init(spawn_reaper);
    if let Err(mpsc::SendError(doomed)) = tx.send(doomed) {
        doomed.kill_and_wait();
    }
}

/// A dropped receiver makes every later [`terminate`] reap inline.
fn spawn_reaper() -> mpsc::Sender<Doomed> {
    let (tx, rx) = mpsc::channel::<Doomed>();
    let spawned = thread::Builder::new()
        .name("cvm-sandbox-reaper".to_string())
        .spawn(move || reap_loop(&rx));
    if let Err(err) = spawned {
        warn!(error = %err, "spawn sandbox reaper; sandboxes will be reaped inline");
    }
    tx
}

fn reap_loop(rx: &mpsc::Receiver<Doomed>) {
    let mut pending: Vec<Doomed> = Vec::new();
    loop {
        let next = if pending.is_empty() {
            rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(TICK)
        };
        match next {
            Ok(doomed) => pending.push(doomed),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) if pending.is_empty() => return,
            Err(mpsc::RecvTimeoutError::Disconnected) => thread::sleep(TICK),
        }
        let now = Instant::now();
        pending.retain_mut(|d| !d.poll(now));
    }
}
