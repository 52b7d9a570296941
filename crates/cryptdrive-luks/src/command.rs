//! Execution wrapper for the host binaries the providers shell out to.
//!
//! Keeps process plumbing in one place so provider logic stays testable with
//! fake binaries and deterministic stdout parsing.

use cryptdrive_core::error::{CryptdriveError, CryptdriveResult};
use log::trace;
use std::env;
use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

#[derive(Debug, Clone)]
pub(crate) struct HostCommand {
    binary: PathBuf,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub(crate) fn success(&self) -> bool {
        self.status == 0
    }

    /// stderr when present, stdout otherwise.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Diagnostic suitable for embedding in an error message.
    pub(crate) fn describe(&self) -> String {
        let diagnostic = self.diagnostic();
        if diagnostic.is_empty() {
            "no additional output".to_string()
        } else {
            diagnostic
        }
    }
}

impl HostCommand {
    pub(crate) fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Locate `tool`: an explicit configured path wins, then the well-known
    /// locations, then `PATH`.
    pub(crate) fn resolve(
        tool: &str,
        configured: Option<&str>,
        defaults: &[&str],
    ) -> CryptdriveResult<Self> {
        if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
            let candidate = Path::new(path);
            if !candidate.exists() {
                return Err(CryptdriveError::Configuration(format!(
                    "{tool} binary not found at {}",
                    candidate.display()
                )));
            }
            return Ok(Self::new(candidate));
        }

        if let Some(found) = defaults
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.exists())
        {
            return Ok(Self::new(found));
        }

        find_in_path(tool).map(Self::new).ok_or_else(|| {
            CryptdriveError::Configuration(format!(
                "unable to locate {tool}; tried {defaults:?} and PATH"
            ))
        })
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run the binary, feeding `input` on stdin, and capture its output.
    pub(crate) fn run<I, S>(&self, args: I, input: Option<&[u8]>) -> CryptdriveResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        trace!("exec {command:?}");

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                CryptdriveError::Provider(format!("{} not found", self.binary.display()))
            } else {
                CryptdriveError::Io(err)
            }
        })?;

        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());

        let fed = match (input, child.stdin.take()) {
            (Some(payload), Some(mut stdin)) => feed_stdin(&mut stdin, payload),
            _ => Ok(()),
        };

        // Reap the child and its readers before reporting a failed write.
        let status = child.wait()?;
        let stdout = stdout_handle
            .join()
            .map_err(|_| CryptdriveError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| CryptdriveError::Provider("stderr reader thread panicked".into()))??;
        fed?;

        Ok(Output {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }

    /// Run the binary and turn a non-zero exit into a `Provider` error.
    pub(crate) fn run_checked<I, S>(&self, args: I, action: &str) -> CryptdriveResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.run(args, None)?;
        if out.success() {
            return Ok(out);
        }
        Err(CryptdriveError::Provider(format!(
            "{action} failed: {} (exit code {})",
            out.describe(),
            out.status
        )))
    }
}

/// Write `payload` and close the pipe. A child that exits before draining
/// stdin is reported through its status, so a broken pipe is not an error.
fn feed_stdin<W: Write>(stdin: &mut W, payload: &[u8]) -> io::Result<()> {
    match stdin.write_all(payload).and_then(|()| stdin.flush()) {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<CryptdriveResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> CryptdriveResult<String> {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

pub(crate) fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}
