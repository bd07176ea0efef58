//! Child processes with a deadline and bounded output capture.
//!
//! stdin, stdout, and stderr are each serviced on their own thread so a child
//! that writes before it finishes reading can never block on a full pipe.
//! On unix the child leads its own process group, and a timeout kills the group.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK: usize = 8192;
/// How long the stream threads get to finish once the child is gone.
const STREAM_GRACE: Duration = Duration::from_secs(2);
const STREAM_POLL: Duration = Duration::from_millis(10);

/// The retained prefix of one output stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes read past the limit and discarded.
    pub dropped: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

impl Captured {
    /// Read `reader` to EOF into `sink`, which stays readable while this runs.
    fn drain<R: Read>(mut reader: R, limit: usize, sink: &SharedCapture) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("read child output"),
            };
            let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
            let room = limit.saturating_sub(captured.bytes.len()).min(n);
            captured.bytes.extend_from_slice(&chunk[..room]);
            captured.dropped += n - room;
        }
    }

    fn snapshot(sink: &SharedCapture) -> Self {
        sink.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    /// The deadline passed and the child was killed.
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        self.stdout.text()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.text()
    }

    /// One line per stream that lost bytes to the limit; empty when nothing was dropped.
    pub fn truncation_notice(&self, label: &str) -> String {
        [("stdout", &self.stdout), ("stderr", &self.stderr)]
            .iter()
            .filter(|(_, captured)| captured.dropped > 0)
            .map(|(stream, captured)| {
                format!("\n[{label} {stream} truncated {} bytes]\n", captured.dropped)
            })
            .collect()
    }

    /// Last non-empty stderr line.
    pub fn stderr_tail(&self) -> Option<String> {
        self.stderr_text()
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
    }
}

/// Run `cmd` to completion or until `timeout`, feeding it `stdin` and keeping at
/// most `output_limit_bytes` of each output stream.
///
/// A child that overruns is killed along with its process group and reaped; the
/// result then has `timed_out` set. Descendants that keep a pipe open past the
/// grace period are abandoned and their stream is returned as captured so far.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn");
        anyhow!(err).context(format!("spawn {:?}", cmd.get_program()))
    })?;

    let stdout = spawn_reader(child.stdout.take(), output_limit_bytes, "stdout")?;
    let stderr = spawn_reader(child.stderr.take(), output_limit_bytes, "stderr")?;
    let feeder = match stdin {
        Some(input) => Some(spawn_feeder(&mut child, input.to_vec())?),
        None => None,
    };

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;

    let grace_ends = Instant::now() + STREAM_GRACE;
    if let Some(feeder) = feeder {
        join_within(feeder, "stdin", grace_ends)?.unwrap_or(Ok(()))?;
    }
    let stdout = collect(stdout, "stdout", grace_ends)?;
    let stderr = collect(stderr, "stderr", grace_ends)?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "child output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

struct StreamReader {
    handle: JoinHandle<Result<()>>,
    sink: SharedCapture,
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
    limit: usize,
    stream: &str,
) -> Result<StreamReader> {
    let pipe = pipe.ok_or_else(|| anyhow!("{stream} was not piped"))?;
    let sink = SharedCapture::default();
    let thread_sink = Arc::clone(&sink);
    let handle = thread::spawn(move || Captured::drain(pipe, limit, &thread_sink));
    Ok(StreamReader { handle, sink })
}

/// Whatever the stream produced by `deadline`, or everything if it reached EOF.
fn collect(reader: StreamReader, stream: &str, deadline: Instant) -> Result<Captured> {
    if let Some(read) = join_within(reader.handle, stream, deadline)? {
        read?;
    }
    Ok(Captured::snapshot(&reader.sink))
}

fn spawn_feeder(child: &mut Child, input: Vec<u8>) -> Result<JoinHandle<Result<()>>> {
    let mut pipe = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    Ok(thread::spawn(move || {
        // The child may exit without reading its input.
        match pipe.write_all(&input) {
            Err(err) if err.kind() != ErrorKind::BrokenPipe => Err(err).context("write stdin"),
            _ => Ok(()),
        }
    }))
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), "deadline passed, killing child");
    kill_group(child)?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

/// Kill the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => warn!(exit_code = ?status.code(), "group kill failed, killing child only"),
            Err(err) => warn!(err = %err, "group kill failed, killing child only"),
        }
    }
    match child.kill() {
        Err(err) if err.kind() != ErrorKind::InvalidInput => Err(err).context("kill child"),
        _ => Ok(()),
    }
}

/// Join a stream thread, giving up at `deadline`. `None` means the thread was
/// left running because a descendant still holds its pipe.
fn join_within<T>(handle: JoinHandle<T>, stream: &str, deadline: Instant) -> Result<Option<T>> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(stream, "pipe still open after child exit, abandoning stream");
            return Ok(None);
        }
        thread::sleep(STREAM_POLL);
    }
    handle
        .join()
        .map(Some)
        .map_err(|_| anyhow!("{stream} thread panicked"))
}
