//! Transfer helper mode
//!
//! The agent binary re-invoked by the interactive user inside a terminal
//! session (`-R` to receive, `-S <path>` to send). It creates the named
//! pipe, announces itself to the agent by writing the magic sequence to
//! its own stdout (which is the session's PTY), then follows the control
//! frames and paints a progress line. All user-facing output goes to the
//! terminal directly; this mode never touches the log.

use std::io::Write;
use std::path::Path;
use std::process::exit;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;

use rtty_core::util::format_size;
use rtty_protocol::filectl::{
    fifo_path, CtlFrame, CtlType, TransferDir, TransferRequest, CTL_FRAME_LEN, FILE_SIZE_LIMIT,
};

const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Run the helper; exits the process when the transfer ends.
pub async fn request(send_path: Option<&Path>) {
    let pid = std::process::id();

    let mut total_size: u32 = 0;
    let mut source: Option<std::fs::File> = None;

    if let Some(path) = send_path {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                println!("open '{}' failed: No such file", path.display());
                exit(1);
            }
            Err(e) => {
                println!("open '{}' failed: {e}", path.display());
                exit(1);
            }
        };

        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                println!("stat '{}' failed: {e}", path.display());
                exit(1);
            }
        };

        if !meta.is_file() {
            println!("'{}' is not a regular file", path.display());
            exit(1);
        }

        if meta.len() > FILE_SIZE_LIMIT {
            println!("'{}' is too large(> {FILE_SIZE_LIMIT} Byte)", path.display());
            exit(1);
        }

        total_size = meta.len() as u32;
        source = Some(file);
    } else if !cwd_writable() {
        println!("Permission denied");
        exit(1);
    }

    let fifo = fifo_path(pid);

    if make_fifo(&fifo).is_err() {
        eprintln!("Could not create fifo {}", fifo.display());
        exit(1);
    }

    // Ctrl+C must not leave the pipe behind.
    {
        let fifo = fifo.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            println!();
            let _ = std::fs::remove_file(&fifo);
            exit(0);
        });
    }

    // Give the agent's PTY reader a moment before the magic goes out.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let dir = match &source {
        Some(file) => {
            #[cfg(unix)]
            let fd = {
                use std::os::fd::AsRawFd;
                file.as_raw_fd() as u32
            };
            #[cfg(not(unix))]
            let fd = 0;
            TransferDir::Send { fd }
        }
        None => TransferDir::Recv,
    };

    let magic = TransferRequest { pid, dir }.encode();
    {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&magic);
        let _ = stdout.flush();
    }

    let ctl = match tokio::fs::File::open(&fifo).await {
        Ok(ctl) => ctl,
        Err(_) => {
            eprintln!("Could not open fifo {}", fifo.display());
            let _ = std::fs::remove_file(&fifo);
            exit(1);
        }
    };

    follow_transfer(ctl, source, total_size, send_path).await;

    let _ = std::fs::remove_file(&fifo);
    exit(0);
}

/// Consume control frames until the transfer ends one way or another.
async fn follow_transfer(
    mut ctl: tokio::fs::File,
    mut source: Option<std::fs::File>,
    mut total_size: u32,
    path: Option<&Path>,
) {
    let mut started: Option<Instant> = None;
    let mut frame = [0u8; CTL_FRAME_LEN];

    loop {
        // The agent closing its end of the pipe ends the transfer.
        if ctl.read_exact(&mut frame).await.is_err() {
            return;
        }

        let Some(msg) = CtlFrame::decode(&frame) else {
            continue;
        };

        match msg.typ {
            CtlType::RequestAccept => {
                if let Some(file) = source.take() {
                    // The agent has its own descriptor by now.
                    drop(file);
                    started = Some(Instant::now());

                    let name = basename(path);
                    println!("Transferring '{name}'...Press Ctrl+C to cancel");
                    if total_size == 0 {
                        println!("  100%    0 B     0s");
                    }
                } else {
                    println!("Waiting to receive. Press Ctrl+C to cancel");
                }
            }

            CtlType::Info => {
                total_size = msg.value_u32();
                let name = ctl_string(&msg.value[4..]);
                println!("Transferring '{name}'...");
                if total_size == 0 {
                    println!("  100%    0 B     0s");
                    return;
                }
                started = Some(Instant::now());
            }

            CtlType::Progress => {
                let remain = msg.value_u32();
                print_progress(started, total_size, remain);
                if remain == 0 {
                    println!();
                    return;
                }
            }

            CtlType::Abort => {
                println!("\nTransfer aborted");
                return;
            }

            CtlType::Busy => {
                println!("{RED}Rtty is busy to transfer file{RESET}");
                return;
            }

            CtlType::NoSpace => {
                println!("{RED}No enough space{RESET}");
                return;
            }

            CtlType::ErrExist => {
                println!("{RED}The file already exists{RESET}");
                return;
            }

            CtlType::Err => {
                println!("{RED}Transfer failed{RESET}");
                return;
            }
        }
    }
}

fn print_progress(started: Option<Instant>, total: u32, remain: u32) {
    let elapsed = started.map(|t| t.elapsed().as_secs_f64()).unwrap_or_default();
    let transferred = total.saturating_sub(remain);
    let percentage = if total == 0 {
        100
    } else {
        transferred as u64 * 100 / total as u64
    };

    print!("{:100}\r", ' ');
    print!(
        "  {percentage}%    {}     {elapsed:.3}s\r",
        format_size(transferred as u64)
    );
    let _ = std::io::stdout().flush();
}

fn basename(path: Option<&Path>) -> String {
    path.and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Zero-padded value area to string, up to the first NUL.
fn ctl_string(value: &[u8]) -> String {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    String::from_utf8_lossy(&value[..end]).into_owned()
}

/// Receiving drops files into the cwd, which therefore must be writable.
#[cfg(unix)]
fn cwd_writable() -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(".")
        .map(|m| m.permissions().mode() & 0o200 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn cwd_writable() -> bool {
    false
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<(), ()> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o644)).map_err(|_| ())
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> Result<(), ()> {
    Err(())
}
