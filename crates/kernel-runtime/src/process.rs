//! Kernel process management.
//!
//! This module handles starting, greeting, and stopping the kernel process.
//! The kernel talks over its standard streams: the first line it writes to
//! stdout is a JSON greeting (`{"hello": "<kernel identifier>"}`), and it
//! exits when it reads `{"exit": 0}` on stdin. Anything it writes to stderr
//! is forwarded to the log.

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::kernel::{CloseToken, KernelClient, KernelFactory};
use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on the greeting line, newline included.
const MAX_GREETING_BYTES: u64 = 64 * 1024;

/// Greeting the kernel writes as its first stdout line.
#[derive(Debug, Deserialize)]
struct Hello {
    hello: String,
}

/// Request asking the kernel to terminate.
#[derive(Debug, Serialize)]
struct Exit {
    exit: i32,
}

/// Find the kernel binary.
///
/// Paths (anything with a separator) are used as given; bare names are
/// looked up in PATH. If the lookup fails the name is returned unchanged and
/// spawning reports the real error.
fn find_program(program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.to_path_buf();
    }
    match which::which(program) {
        Ok(found) => {
            log::debug!("Found kernel in PATH: {}", found.display());
            found
        }
        Err(e) => {
            log::warn!("Could not find '{}' in PATH ({}). Trying it as given.", program, e);
            PathBuf::from(program)
        }
    }
}

/// Kill and reap a child, ignoring errors from an already-dead process.
///
/// On Unix the kernel leads its own process group, and the whole group is
/// killed so helpers it spawned do not keep the pipes open.
fn kill_and_reap(child: &mut Child) {
    #[cfg(unix)]
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
        // targets the process group the child was placed in at spawn.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Wait for the kernel greeting on a helper thread.
///
/// On success the stdout reader is handed back so the pipe stays open for
/// the lifetime of the client.
fn read_hello(stdout: ChildStdout, timeout: Duration) -> Result<(String, BufReader<ChildStdout>)> {
    let (tx, rx) = crossbeam_channel::bounded(1);

    std::thread::Builder::new()
        .name("kernel-handshake".into())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            let result = match (&mut reader).take(MAX_GREETING_BYTES).read_line(&mut line) {
                Ok(0) => Err(Error::Handshake(
                    "kernel closed stdout before greeting".to_string(),
                )),
                Ok(_) if !line.ends_with('\n') && line.len() as u64 >= MAX_GREETING_BYTES => {
                    Err(Error::Handshake(format!(
                        "greeting exceeds {} bytes",
                        MAX_GREETING_BYTES
                    )))
                }
                Ok(_) => Ok(line),
                Err(e) => Err(Error::Io(e)),
            };
            // The receiver is gone if the handshake already timed out.
            let _ = tx.send(result.map(|line| (line, reader)));
        })?;

    let (line, reader) = match rx.recv_timeout(timeout) {
        Ok(result) => result?,
        Err(RecvTimeoutError::Timeout) => return Err(Error::HandshakeTimeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => {
            return Err(Error::Handshake("handshake reader thread died".to_string()))
        }
    };

    let hello: Hello = serde_json::from_str(line.trim()).map_err(|e| {
        Error::Handshake(format!("unexpected greeting {:?}: {}", line.trim(), e))
    })?;
    Ok((hello.hello, reader))
}

/// [`KernelFactory`] that starts the kernel as a child process.
#[derive(Debug, Clone)]
pub struct ProcessKernel {
    config: KernelConfig,
}

impl ProcessKernel {
    pub fn new(config: KernelConfig) -> Self {
        Self { config }
    }

    /// The launch configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }
}

impl KernelFactory for ProcessKernel {
    type Client = ProcessClient;

    fn construct(&self) -> Result<ProcessClient> {
        ProcessClient::start(&self.config)
    }
}

/// Pipes kept open while the kernel runs.
struct Pipes {
    stdin: ChildStdin,
    _stdout: BufReader<ChildStdout>,
}

/// A running kernel process.
///
/// When dropped, a still-running kernel is killed.
///
/// # Example
///
/// ```ignore
/// let client = ProcessClient::start(&KernelConfig::for_program("kernel-host"))?;
/// println!("kernel {} running as pid {}", client.kernel_version(), client.pid());
/// drop(client); // kills the kernel
/// ```
///
/// Graceful shutdown goes through [`Lifecycle::release`](crate::Lifecycle::release).
pub struct ProcessClient {
    child: Mutex<Option<Child>>,
    pipes: Mutex<Option<Pipes>>,
    pid: u32,
    kernel_version: String,
    shutdown_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl ProcessClient {
    /// Spawn the kernel and complete the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel cannot be started, exits before
    /// greeting, greets with something unexpected, or does not greet within
    /// `handshake_timeout`. The child is killed before the error is returned.
    pub fn start(config: &KernelConfig) -> Result<Self> {
        let program = find_program(&config.program);
        log::info!("Starting kernel {}...", program.display());

        let mut cmd = Command::new(&program);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id();

        // Forward kernel diagnostics to the log
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(std::result::Result::ok) {
                    log::warn!("[kernel] {}", line);
                }
            });
        }

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                kill_and_reap(&mut child);
                return Err(Error::Handshake("kernel pipes unavailable".to_string()));
            }
        };

        let start = Instant::now();
        let (kernel_version, stdout) = match read_hello(stdout, config.handshake_timeout) {
            Ok(greeting) => greeting,
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(e);
            }
        };

        log::info!(
            "Kernel {} ready (pid {}, greeted after {:.1}s)",
            kernel_version,
            pid,
            start.elapsed().as_secs_f32()
        );

        Ok(Self {
            child: Mutex::new(Some(child)),
            pipes: Mutex::new(Some(Pipes {
                stdin,
                _stdout: stdout,
            })),
            pid,
            kernel_version,
            shutdown_timeout: config.shutdown_timeout,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Identifier the kernel sent in its greeting.
    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    /// OS process id of the kernel.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check if the kernel process has not been closed yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Poll until the child exits or `timeout` elapses.
    fn wait_timeout(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl KernelClient for ProcessClient {
    /// Ask the kernel to exit and wait for it.
    ///
    /// Closing an already closed client is a no-op.
    fn close(&self, _: CloseToken) -> Result<()> {
        let mut child = match self.child.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(child) => child,
            None => return Ok(()),
        };
        self.running.store(false, Ordering::Relaxed);
        log::info!("Stopping kernel (pid {})...", self.pid);

        if let Some(mut pipes) = self.pipes.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let request = serde_json::to_string(&Exit { exit: 0 })?;
            if let Err(e) = writeln!(pipes.stdin, "{}", request).and_then(|_| pipes.stdin.flush()) {
                // A kernel that already went away closes the pipe first.
                if e.kind() != ErrorKind::BrokenPipe {
                    log::debug!("Failed to send exit request to kernel: {}", e);
                }
            }
            // Dropping the pipes sends EOF.
        }

        match Self::wait_timeout(&mut child, self.shutdown_timeout) {
            Ok(Some(status)) if status.success() => {
                log::info!("Kernel stopped");
                Ok(())
            }
            Ok(Some(status)) => Err(Error::KernelExited(status)),
            Ok(None) => {
                kill_and_reap(&mut child);
                Err(Error::ShutdownTimeout(self.shutdown_timeout))
            }
            Err(e) => {
                kill_and_reap(&mut child);
                Err(e)
            }
        }
    }
}

impl Drop for ProcessClient {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut child) = child.take() {
            log::info!("Killing kernel (pid {})", self.pid);
            self.running.store(false, Ordering::Relaxed);
            kill_and_reap(&mut child);
        }
    }
}
