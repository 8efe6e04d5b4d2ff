//! Child-process execution context for governed work.
//!
//! The child reports back over its stdout with a single [`WorkerReply`]
//! document. A reader thread forwards the bytes into a bounded channel so the
//! parent can check for a result without blocking once the child has exited.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// How long to wait for the reader thread after a normal exit. Pipes can be
/// held open by orphaned grandchildren, so the wait is bounded.
const RESULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerReply<T> {
    Ok(T),
    Err(String),
}

/// Writes the reply document the parent expects on stdout.
pub fn write_reply<T: Serialize>(reply: &WorkerReply<T>) -> Result<()> {
    let bytes = serde_json::to_vec(reply)
        .map_err(|e| Error::Isolation(format!("serializing worker reply: {e}")))?;
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(&bytes)
        .and_then(|()| stdout.flush())
        .map_err(|e| Error::io("writing worker reply", e))
}

pub struct IsolatedProcess {
    pid: u32,
    child: Mutex<Child>,
    terminated: AtomicBool,
}

impl IsolatedProcess {
    /// Spawns `cmd` with a piped stdout and returns the handle plus the
    /// receiving end of the result channel.
    pub fn spawn(mut cmd: Command) -> Result<(Self, Receiver<Vec<u8>>)> {
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::inherit());
        // Own process group, so terminate reaches the recognizers it starts.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io(format!("spawning isolated worker {:?}", cmd.get_program()), e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Isolation("isolated worker has no stdout".into()))?;

        let (tx, rx) = sync_channel(1);
        std::thread::Builder::new()
            .name("isolate-reader".into())
            .spawn(move || forward_stdout(stdout, tx))
            .map_err(|e| Error::io("spawning result reader", e))?;

        let pid = child.id();
        debug!(pid, "isolated worker started");
        Ok((
            Self {
                pid,
                child: Mutex::new(child),
                terminated: AtomicBool::new(false),
            },
            rx,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Kills the child together with every process in its group. Only the
    /// first call acts; killing a child that has already exited is a no-op.
    /// Returns whether this call did the termination.
    pub fn terminate(&self) -> bool {
        if self
            .terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let mut child = self.lock_child();
        // The group outlives its leader, so it is signalled even after the
        // worker itself has exited.
        kill_group(self.pid);
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = self.pid, %status, "isolated worker already finished");
            }
            _ => {
                if let Err(err) = child.kill() {
                    warn!(pid = self.pid, "killing isolated worker failed: {err}");
                }
            }
        }
        true
    }

    /// Non-blocking exit check. The lock is only held for the poll so
    /// [`terminate`](Self::terminate) can get in from the sampler thread.
    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        self.lock_child()
            .try_wait()
            .map_err(|e| Error::io("waiting for isolated worker", e))
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, "killing worker process group: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

fn forward_stdout(mut stdout: impl Read, tx: SyncSender<Vec<u8>>) {
    let mut buf = Vec::new();
    if let Err(err) = stdout.read_to_end(&mut buf) {
        debug!("reading isolated worker stdout: {err}");
    }
    let _ = tx.send(buf);
}

/// Decodes the reply of a child that exited on its own.
pub fn receive_reply<T: DeserializeOwned>(rx: &Receiver<Vec<u8>>, status: ExitStatus) -> Result<T> {
    let bytes = match rx.try_recv() {
        Ok(bytes) => bytes,
        Err(_) => match rx.recv_timeout(RESULT_GRACE) {
            Ok(bytes) => bytes,
            Err(RecvTimeoutError::Timeout) => {
                return Err(Error::Isolation(format!(
                    "worker exited ({status}) but its output stayed open"
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Isolation(format!(
                    "worker exited ({status}) without a result"
                )));
            }
        },
    };
    if bytes.is_empty() {
        return Err(Error::Isolation(format!("worker exited ({status}) without a result")));
    }
    match serde_json::from_slice::<WorkerReply<T>>(&bytes) {
        Ok(WorkerReply::Ok(value)) => Ok(value),
        Ok(WorkerReply::Err(message)) => Err(Error::Isolation(message)),
        Err(e) => Err(Error::Isolation(format!(
            "worker exited ({status}) with an unreadable result: {e}"
        ))),
    }
}
