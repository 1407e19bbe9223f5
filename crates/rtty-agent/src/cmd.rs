//! Command executor
//!
//! One-shot program invocations requested by the broker, run under the
//! target user's credentials with a wall-clock deadline and an output
//! cap. Concurrency is bounded by a process-wide semaphore so a chatty
//! broker cannot fork-bomb the device. Every outcome is reported inline
//! as a Cmd JSON reply; nothing here can take the connection down.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::process::Command;

use rtty_protocol::message::{cmd_err_reply, cmd_reply};
use rtty_protocol::{CmdError, CmdRequest, MessageType};

use crate::client::Shared;

/// Simultaneous command executions
pub(crate) const CMD_RUNNING_LIMIT: usize = 5;

/// Wall-clock deadline per command
const CMD_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Combined stdout+stderr cap
const CMD_MAX_OUTPUT: usize = 1024 * 1024;

/// Resolved credentials of the target user
#[derive(Debug, Clone, Copy)]
pub(crate) struct UserIds {
    uid: u32,
    gid: u32,
}

/// Handle a Cmd frame: resolve user and program, then run the command on
/// its own task if a semaphore slot is free.
pub(crate) async fn handle_cmd_msg(shared: &Arc<Shared>, payload: &[u8]) -> Result<()> {
    let req = match CmdRequest::parse(payload) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!("invalid command message format: {e}");
            return Ok(());
        }
    };

    tracing::debug!(
        "command: {}, username: {}, token: {}, params: {:?}",
        req.name,
        req.username,
        req.token,
        req.params
    );

    let Some(user) = lookup_user(&req.username) else {
        return reply_err(shared, &req.token, CmdError::Permit).await;
    };

    let Some(path) = lookup_path(&req.name) else {
        tracing::error!("command not found: {}", req.name);
        return reply_err(shared, &req.token, CmdError::NotFound).await;
    };

    match shared.cmd_slots.clone().try_acquire_owned() {
        Ok(permit) => {
            let shared = shared.clone();
            tokio::spawn(async move {
                let _permit = permit;
                execute_command(&shared, &req, user, &path, CMD_EXEC_TIMEOUT).await;
            });
            Ok(())
        }
        Err(_) => {
            tracing::warn!("command limit reached: {CMD_RUNNING_LIMIT}");
            reply_err(shared, &req.token, CmdError::NoMem).await
        }
    }
}

/// Run one command to completion and send the reply.
pub(crate) async fn execute_command(
    shared: &Shared,
    req: &CmdRequest,
    user: UserIds,
    path: &Path,
    deadline: Duration,
) {
    tracing::debug!(
        "starting command execution: {}, token: {}",
        path.display(),
        req.token
    );

    let mut cmd = Command::new(path);
    cmd.args(&req.params)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        cmd.uid(user.uid);
        cmd.gid(user.gid);
    }
    #[cfg(not(unix))]
    let _ = user;

    let output = match tokio::time::timeout(deadline, cmd.output()).await {
        Err(_) => {
            tracing::error!("command timeout: {}, token: {}", path.display(), req.token);
            let _ = reply_err(shared, &req.token, CmdError::SysErr).await;
            return;
        }
        Ok(Err(e)) => {
            tracing::error!(
                "command execution failed: {}, token: {}: {e}",
                path.display(),
                req.token
            );
            let _ = reply_err(shared, &req.token, CmdError::SysErr).await;
            return;
        }
        Ok(Ok(output)) => output,
    };

    if output.stdout.len() + output.stderr.len() > CMD_MAX_OUTPUT {
        tracing::error!(
            "command output too large: {}, token: {}",
            path.display(),
            req.token
        );
        let _ = reply_err(shared, &req.token, CmdError::RespTooBig).await;
        return;
    }

    let code = output.status.code().unwrap_or(-1);
    let reply = cmd_reply(&req.token, code, &output.stdout, &output.stderr);
    let _ = shared
        .send_frame(MessageType::Cmd, &[reply.as_bytes()])
        .await;
}

async fn reply_err(shared: &Shared, token: &str, err: CmdError) -> Result<()> {
    let reply = cmd_err_reply(token, err);
    shared
        .send_frame(MessageType::Cmd, &[reply.as_bytes()])
        .await
}

#[cfg(unix)]
fn lookup_user(name: &str) -> Option<UserIds> {
    let user = nix::unistd::User::from_name(name).ok().flatten()?;
    Some(UserIds {
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
    })
}

#[cfg(not(unix))]
fn lookup_user(_name: &str) -> Option<UserIds> {
    None
}

/// Resolve a program name the way the shell would: names with a slash
/// are taken as-is, everything else is searched on PATH.
fn lookup_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
