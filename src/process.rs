//! One spawned tunnel process.
//!
//! A `RunningInstance` is created by `spawn` and owns a single monitor task. The
//! monitor owns the OS child handle: it drains stdout/stderr into the shared log,
//! applies termination requests, and reports the exit once output is drained.
//! Nothing outside the monitor touches the child, so signals are never sent to a
//! pid that has already been reaped.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::identity::ConfigIdentity;
use crate::output::LogAggregator;

/// How long readers may keep going after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(1000);

/// Program (and leading arguments) used to run configurations of one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinarySpec {
    pub program: String,
    /// Arguments placed before the config path.
    pub args: Vec<String>,
}

impl BinarySpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigTerm,
    SigKill,
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Force,
}

/// Outcome of a finished process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Whether the exit followed a termination request.
    pub requested: bool,
}

/// A live child process plus its monitor task.
#[derive(Debug)]
pub struct RunningInstance {
    identity: ConfigIdentity,
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    control: mpsc::Sender<Termination>,
    monitor: JoinHandle<ExitRecord>,
}

/// Spawns `binary` with `config_path` as its final argument.
///
/// `on_exit` runs on the monitor task after the process has exited and its output
/// has been drained, whether or not termination was requested.
pub fn spawn<F>(
    identity: ConfigIdentity,
    generation: u64,
    binary: &BinarySpec,
    config_path: &Path,
    log: LogAggregator,
    on_exit: F,
) -> std::io::Result<RunningInstance>
where
    F: FnOnce(ExitRecord) + Send + 'static,
{
    let mut command = Command::new(&binary.program);
    command.args(&binary.args).arg(config_path);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let pid = child.id();

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(drain_output(stdout, log.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(drain_output(stderr, log)));
    }

    let (control, control_rx) = mpsc::channel(2);
    let monitor = tokio::spawn(async move {
        let record = supervise(child, control_rx, readers).await;
        on_exit(record);
        record
    });

    Ok(RunningInstance {
        identity,
        generation,
        pid,
        started_at: Instant::now(),
        control,
        monitor,
    })
}

impl RunningInstance {
    pub fn identity(&self) -> &ConfigIdentity {
        &self.identity
    }

    /// Spawn counter value; distinguishes successive processes of one identity.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Terminates the process and waits until its output is drained.
    ///
    /// Sends a graceful signal first and escalates to a forced kill once `grace`
    /// elapses. Returns immediately if the process already exited.
    pub async fn terminate(self, grace: Duration) -> Result<ExitRecord, JoinError> {
        let RunningInstance {
            identity,
            control,
            mut monitor,
            ..
        } = self;
        if !monitor.is_finished() {
            let _ = control.try_send(Termination::Graceful);
            match tokio::time::timeout(grace, &mut monitor).await {
                Ok(result) => return result,
                Err(_) => {
                    tracing::warn!(
                        identity = %identity,
                        grace_ms = grace.as_millis() as u64,
                        "process ignored graceful signal, killing"
                    );
                    let _ = control.try_send(Termination::Force);
                }
            }
        }
        monitor.await
    }
}

async fn supervise(
    mut child: Child,
    mut control: mpsc::Receiver<Termination>,
    readers: Vec<JoinHandle<()>>,
) -> ExitRecord {
    let mut requested = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = control.recv() => {
                requested = true;
                match request {
                    Termination::Graceful => signal_child(&child, ProcessSignal::SigTerm),
                    Termination::Force => {
                        signal_child(&child, ProcessSignal::SigKill);
                        let _ = child.start_kill();
                    }
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to wait for process");
            None
        }
    };

    // A grandchild can keep the pipes open after the child is gone.
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout_at(deadline, reader).await.is_err() {
            abort.abort();
        }
    }

    ExitRecord { code, requested }
}

async fn drain_output<R>(reader: R, log: LogAggregator)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut chunk = Vec::with_capacity(256);
    loop {
        chunk.clear();
        match reader.read_until(b'\n', &mut chunk).await {
            Ok(0) => break,
            Ok(_) => log.append(&String::from_utf8_lossy(&chunk)),
            Err(err) => {
                tracing::debug!(error = %err, "output stream closed with error");
                break;
            }
        }
    }
}

fn signal_child(child: &Child, signal: ProcessSignal) {
    if let Some(pid) = child.id() {
        send_os_signal(pid, signal);
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Forced kills go through `Child::start_kill`; only the graceful stage has a console event.
    if signal == ProcessSignal::SigTerm {
        unsafe {
            let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
        }
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}
