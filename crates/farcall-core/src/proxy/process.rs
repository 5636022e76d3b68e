//! Spawned server process handle
//!
//! Owned by the proxy that started the server. A proxy that reconnected to
//! an already running server never holds one of these.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ServerCommand;
use crate::error::{Error, Result};
use crate::transport::Endpoint;

pub struct ServerProcess {
    child: Child,
    program: String,
}

impl ServerProcess {
    /// Launch `command` listening on `endpoint`, with stdout/stderr piped
    pub fn spawn(command: &ServerCommand, endpoint: &Endpoint) -> Result<Self> {
        let program = command.program.display().to_string();
        let args = command.args_for(endpoint);
        info!("Starting server: {} {}", program, args.join(" "));

        let child = Command::new(&command.program)
            .args(&args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to start `{program}`: {e}")))?;

        Ok(Self { child, program })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the process has already exited
    pub fn poll(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Wait for exit and collect whatever the process printed
    pub async fn communicate(self) -> String {
        match self.child.wait_with_output().await {
            Ok(output) => {
                let mut text = format!("{} exited with {}", self.program, output.status);
                for (name, bytes) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
                    let captured = String::from_utf8_lossy(bytes);
                    let captured = captured.trim();
                    if !captured.is_empty() {
                        text.push_str(&format!("\n--- {name} ---\n{captured}"));
                    }
                }
                text
            }
            Err(e) => format!("{} output unavailable: {}", self.program, e),
        }
    }

    /// Drain stdout/stderr into tracing so the child never blocks on a full pipe
    pub fn forward_output(&mut self) {
        if let Some(stdout) = self.child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = self.child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }
    }

    /// Wait up to `grace` for a clean exit, then kill
    pub async fn wait_or_kill(mut self, grace: Duration) -> Result<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!("Server {} did not exit within {:?}, killing it", self.program, grace);
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }

    /// Kill immediately
    pub async fn kill(mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "farcall::server", stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading server {}: {}", stream, e);
                break;
            }
        }
    }
}
