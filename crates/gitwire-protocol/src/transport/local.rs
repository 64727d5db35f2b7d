//! Transport that runs the git service programs as local subprocesses.

use super::{Connection, Service, Transport};
use crate::advertisement::ProtocolVersion;
use crate::config::ClientConfig;
use crate::context::{CancelGuard, Context};
use crate::{GitError, Result};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Keep at most this much of a service's stderr for error messages.
const MAX_STDERR: usize = 64 * 1024;

/// How often `close` checks whether the service has exited.
const WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// Runs `git-upload-pack` / `git-receive-pack` against a repository on disk.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    path: PathBuf,
    url: String,
    upload_pack: String,
    receive_pack: String,
}

impl LocalTransport {
    /// Creates a transport for the repository at `path`.
    pub fn new(path: PathBuf, config: &ClientConfig) -> Self {
        let url = format!("file://{}", path.display());
        Self {
            path,
            url,
            upload_pack: config.upload_pack.clone(),
            receive_pack: config.receive_pack.clone(),
        }
    }

    fn spawn(
        &self,
        ctx: &Context,
        program: &str,
        args: &[&str],
        version: ProtocolVersion,
    ) -> Result<ProcessConnection> {
        ctx.check()?;
        tracing::debug!(program = %program, args = ?args, path = %self.path.display(), %version, "spawning service");

        let mut child = Command::new(program)
            .args(args)
            .arg("--")
            .arg(&self.path)
            .env("GIT_PROTOCOL", version.git_protocol())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GitError::Transport(format!("failed to run {program}: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GitError::Transport(format!("{program}: stdout not captured")))?;
        let stderr = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut captured = Vec::new();
                let mut chunk = [0u8; 4096];
                while let Ok(n) = stderr.read(&mut chunk) {
                    if n == 0 {
                        break;
                    }
                    if captured.len() < MAX_STDERR {
                        captured.extend_from_slice(&chunk[..n]);
                    }
                }
                captured
            })
        });

        let child = Arc::new(Mutex::new(child));
        let killer = Arc::clone(&child);
        let guard = ctx.on_cancel(move || {
            let _ = killer.lock().kill();
        });

        Ok(ProcessConnection {
            program: program.to_string(),
            child,
            stdin,
            stdout,
            stderr,
            ctx: ctx.clone(),
            _guard: guard,
            closed: false,
        })
    }
}

impl Transport for LocalTransport {
    fn url(&self) -> &str {
        &self.url
    }

    fn advertise_refs(
        &self,
        ctx: &Context,
        service: Service,
        version: ProtocolVersion,
    ) -> Result<Box<dyn Read + Send>> {
        let program = match service {
            Service::UploadPack => &self.upload_pack,
            Service::ReceivePack => &self.receive_pack,
        };
        let mut conn = self.spawn(ctx, program, &["--advertise-refs"], version)?;
        conn.end_request()?;
        Ok(Box::new(conn))
    }

    fn upload_pack(&self, ctx: &Context, version: ProtocolVersion) -> Result<Box<dyn Connection>> {
        let conn = self.spawn(ctx, &self.upload_pack, &["--stateless-rpc"], version)?;
        Ok(Box::new(conn))
    }

    fn receive_pack(&self, ctx: &Context) -> Result<Box<dyn Connection>> {
        let conn = self.spawn(ctx, &self.receive_pack, &[], ProtocolVersion::V1)?;
        Ok(Box::new(conn))
    }
}

/// A running service process: requests go to stdin, responses come from stdout.
pub struct ProcessConnection {
    program: String,
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<Vec<u8>>>,
    ctx: Context,
    _guard: CancelGuard,
    closed: bool,
}

impl ProcessConnection {
    fn cancelled_or(&self, err: io::Error) -> io::Error {
        if self.ctx.is_cancelled() {
            GitError::Cancelled.into()
        } else {
            err
        }
    }

    /// Waits for the process to exit. The child lock is only held for each
    /// poll so that a cancel hook can kill it in between.
    fn wait(&self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.child.lock().try_wait()? {
                return Ok(status);
            }
            self.ctx.check()?;
            std::thread::sleep(WAIT_INTERVAL);
        }
    }

    fn stderr_text(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .unwrap_or_default()
    }
}

impl Read for ProcessConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ctx.check()?;
        match self.stdout.read(buf) {
            Ok(0) if self.ctx.is_cancelled() => Err(GitError::Cancelled.into()),
            Ok(n) => Ok(n),
            Err(e) => Err(self.cancelled_or(e)),
        }
    }
}

impl Write for ProcessConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ctx.check()?;
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            io::Error::other(GitError::Transport("request already finished".to_string()))
        })?;
        match stdin.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.cancelled_or(e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Connection for ProcessConnection {
    fn end_request(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.stdin.take();
        // Drain whatever is left so the process is not blocked on a full pipe.
        io::copy(&mut self.stdout, &mut io::sink())?;
        let status = self.wait()?;
        self.closed = true;
        self.ctx.check()?;
        if !status.success() {
            let stderr = self.stderr_text();
            return Err(GitError::Transport(format!(
                "{} exited with {status}: {stderr}",
                self.program
            )));
        }
        tracing::debug!(program = %self.program, "service exited");
        Ok(())
    }
}

impl Drop for ProcessConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.stdin.take();
        let mut child = self.child.lock();
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}
