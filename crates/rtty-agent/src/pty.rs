//! Pseudo-terminal backend
//!
//! Spawns the platform login program under a fresh PTY and exposes the
//! handle the session layer needs: a blocking reader, a writer, resize
//! and an idempotent close. The trait seam keeps the platform specifics
//! out of the session code and lets tests substitute a scripted PTY.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

/// Login program started for every terminal session
const LOGIN_PROGRAM: &str = "/bin/login";

/// A live pseudo-terminal with a child process attached.
pub trait PtyHandle: Send {
    /// Clone a blocking reader for the PTY output.
    fn clone_reader(&mut self) -> Result<Box<dyn Read + Send>>;

    /// Write terminal input to the child.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Resize the terminal window.
    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Kill the child if still alive. Safe to call more than once.
    fn close(&mut self);
}

/// Capability for spawning terminal sessions.
pub trait PtyBackend: Send + Sync {
    /// Start the login program under a new PTY, with `-f <username>` to
    /// skip the second authentication when configured.
    fn spawn(&self, username: Option<&str>) -> Result<Box<dyn PtyHandle>>;
}

/// Production backend using the native PTY system.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoginPtyBackend;

struct LoginPty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    closed: bool,
}

impl PtyBackend for LoginPtyBackend {
    fn spawn(&self, username: Option<&str>) -> Result<Box<dyn PtyHandle>> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY")?;

        let mut cmd = CommandBuilder::new(LOGIN_PROGRAM);
        if let Some(username) = username {
            cmd.args(["-f", username]);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {LOGIN_PROGRAM}"))?;
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")?;

        Ok(Box::new(LoginPty {
            master: pair.master,
            writer,
            child,
            closed: false,
        }))
    }
}

impl PtyHandle for LoginPty {
    fn clone_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        self.master
            .try_clone_reader()
            .context("failed to clone PTY reader")
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize PTY")
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.child.kill();
            self.closed = true;
        }
    }
}

impl Drop for LoginPty {
    fn drop(&mut self) {
        self.close();
    }
}
