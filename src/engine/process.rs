use crate::error::{Error, Result, StepError};
use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs an external tool to completion.
///
/// Failing to start the program is an infrastructure error; a non-zero exit
/// or an exceeded timeout is a failure of `step` only.
pub fn run_tool(step: &str, mut cmd: Command, timeout: Option<Duration>) -> Result<Output> {
    debug!(step, "exec {:?} timeout={:?}", cmd, timeout);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::io(format!("spawning {program}"), e))?;

    let output = match timeout {
        Some(limit) => match wait_with_timeout(&mut child, limit)? {
            Some(output) => output,
            None => {
                return Err(StepError::Timeout {
                    step: step.to_string(),
                    seconds: limit.as_secs(),
                }
                .into());
            }
        },
        None => child
            .wait_with_output()
            .map_err(|e| Error::io(format!("waiting for {program}"), e))?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StepError::failed(
            step,
            format!("{program} exited with {}: {}", output.status, stderr.trim()),
        )
        .into());
    }
    if !output.stderr.is_empty() {
        debug!(step, "{program} stderr: {}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(output)
}

/// Returns `None` when the child had to be killed for exceeding `timeout`.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Option<Output>> {
    // Drain pipes while waiting so chatty tools can't deadlock the child
    // on a full stdout/stderr buffer.
    let stdout_thread = spawn_drain(child.stdout.take());
    let stderr_thread = spawn_drain(child.stderr.take());

    let start = Instant::now();
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::io("try_wait", e))?
        {
            return Ok(Some(Output {
                status,
                stdout: join_drain(stdout_thread),
                stderr: join_drain(stderr_thread),
            }));
        }

        if start.elapsed() > timeout {
            warn!("process timed out after {:?}", timeout);
            let _ = child.kill();
            child.wait().map_err(|e| Error::io("wait after kill", e))?;
            // Grandchildren may still hold the pipes; leave the drain threads detached.
            drop(stdout_thread);
            drop(stderr_thread);
            return Ok(None);
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}

fn spawn_drain<R: Read + Send + 'static>(reader: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_end(&mut buf);
        }
        buf
    })
}

fn join_drain(handle: std::thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}
