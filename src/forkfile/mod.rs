//! In-namespace file service helper.
//!
//! `corrald forkfile <listen_fd> <rootfs_fd> <pidfd> <pid>` runs as a short
//! lived subprocess: it joins the target container's user and mount
//! namespaces (or chroots into the rootfs when no pid is given), then serves
//! SFTP on the inherited listener until idle. One persistent daemon per
//! instance amortizes the namespace-entry cost over many file operations.

pub mod sftp;

use log::{debug, error, info};
use nix::sched::{setns, CloneFlags};
use parking_lot::Mutex;
use std::os::fd::{BorrowedFd, FromRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Idle probe interval; no activity across a probe + confirm window shuts
/// the helper down.
const IDLE_PROBE: Duration = Duration::from_secs(10);
const IDLE_CONFIRM: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Counters {
    connections:  u64,
    transactions: u64,
}

/// Entry point of the hidden subcommand. Returns the process exit code:
/// 0 on clean shutdown, 1 on privilege or namespace-entry failure.
pub async fn run(listen_fd: RawFd, rootfs_fd: RawFd, pidfd: RawFd, pid: i32) -> i32 {
    if !nix::unistd::Uid::effective().is_root() {
        error!("forkfile requires uid 0");
        return 1;
    }

    if let Err(err) = enter_namespace(rootfs_fd, pidfd, pid) {
        error!("forkfile failed to enter the target namespace: {}", err);
        return 1;
    }

    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(listen_fd) };
    if std_listener.set_nonblocking(true).is_err() {
        error!("forkfile could not configure the listener");
        return 1;
    }
    let listener = match tokio::net::UnixListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!("forkfile could not adopt the listener: {}", err);
            return 1;
        }
    };

    let counters = Arc::new(Mutex::new(Counters::default()));
    let (idle_tx, mut idle_rx) = tokio::sync::watch::channel(false);

    // Idle watchdog: take a snapshot, wait, compare. The second compare
    // closes the race where a connection arrives the instant before the
    // probe would have declared the helper idle.
    {
        let counters = counters.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(IDLE_PROBE).await;
                let (t1, c1) = {
                    let c = counters.lock();
                    (c.transactions, c.connections)
                };
                tokio::time::sleep(IDLE_CONFIRM).await;
                let (t2, c2) = {
                    let c = counters.lock();
                    (c.transactions, c.connections)
                };
                if t1 == t2 && c1 == 0 && c2 == 0 {
                    let _ = idle_tx.send(true);
                    return;
                }
            }
        });
    }

    let mut sigint =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!("forkfile could not install the SIGINT handler: {}", err);
                return 1;
            }
        };

    info!("forkfile serving sftp (pid {})", std::process::id());
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("forkfile caught SIGINT, draining connections");
                drain(&counters).await;
                return 0;
            }
            _ = idle_rx.changed() => {
                info!("forkfile idle, shutting down");
                return 0;
            }
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                counters.lock().connections += 1;
                let counters = counters.clone();
                tokio::spawn(async move {
                    let handled = tokio::task::spawn_blocking(move || {
                        let mut stream = match stream.into_std() {
                            Ok(stream) => stream,
                            Err(_) => return 0,
                        };
                        let _ = stream.set_nonblocking(false);
                        let mut session = sftp::SftpSession::new();
                        session.serve(&mut stream).unwrap_or(0)
                    })
                    .await
                    .unwrap_or(0);

                    {
                        let mut c = counters.lock();
                        c.connections -= 1;
                        c.transactions += handled;
                    }
                    // Changes reach the disk before the client acts on them.
                    if let Err(err) = nix::unistd::syncfs(rootfs_fd) {
                        debug!("syncfs after sftp connection failed: {}", err);
                    }
                });
            }
        }
    }
}

/// Joins the container's user and mount namespaces via its pidfd, or chroots
/// into the rootfs when called with `0, 0`. In the chroot case any required
/// id shifting is the caller's problem.
fn enter_namespace(rootfs_fd: RawFd, pidfd: RawFd, pid: i32) -> nix::Result<()> {
    if pid > 0 {
        let fd = unsafe { BorrowedFd::borrow_raw(pidfd) };
        setns(fd, CloneFlags::CLONE_NEWUSER)?;
        let fd = unsafe { BorrowedFd::borrow_raw(pidfd) };
        setns(fd, CloneFlags::CLONE_NEWNS)?;
        nix::unistd::chdir("/")?;
    } else {
        nix::unistd::fchdir(rootfs_fd)?;
        nix::unistd::chroot(".")?;
        nix::unistd::chdir("/")?;
    }
    Ok(())
}

async fn drain(counters: &Arc<Mutex<Counters>>) {
    loop {
        if counters.lock().connections == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// The init process of a running container, as the instance runtime hands it
/// over: a pidfd (kept open so the pid cannot be recycled underneath the
/// helper) plus the pid itself.
pub struct InitHandle {
    pub pidfd: std::fs::File,
    pub pid:   i32,
}

/// Daemon-side launcher: spawns the helper against an instance rootfs and
/// returns a connected SFTP client stream plus the child process.
///
/// The listener and rootfs descriptors are passed by inheritance. With an
/// `InitHandle` the helper joins the running container's user and mount
/// namespaces through the inherited pidfd; without one it chroots into the
/// rootfs, which is the mode for stopped instances.
pub fn spawn(
    rootfs: &Path,
    init: Option<InitHandle>,
) -> std::io::Result<(std::os::unix::net::UnixStream, std::process::Child)> {
    use std::os::fd::AsRawFd;
    use std::os::unix::process::CommandExt;

    let socket_path = std::env::temp_dir().join(format!("corral-forkfile-{}.sock", uuid::Uuid::new_v4()));
    let listener = std::os::unix::net::UnixListener::bind(&socket_path)?;
    let rootfs_file = std::fs::File::open(rootfs)?;

    let exe = std::env::current_exe()?;
    let listener_fd = listener.as_raw_fd();
    let rootfs_fd = rootfs_file.as_raw_fd();
    let init_fds = init.as_ref().map(|init| (init.pidfd.as_raw_fd(), init.pid));

    let mut command = std::process::Command::new(exe);
    command.arg("forkfile").arg("3").arg("4");
    match init_fds {
        Some((_, pid)) => {
            command.arg("5").arg(pid.to_string());
        }
        None => {
            command.arg("0").arg("0");
        }
    }
    unsafe {
        command.pre_exec(move || {
            // dup2 clears O_CLOEXEC on the copies handed to the child.
            nix::unistd::dup2(listener_fd, 3).map_err(std::io::Error::from)?;
            nix::unistd::dup2(rootfs_fd, 4).map_err(std::io::Error::from)?;
            if let Some((pidfd, _)) = init_fds {
                nix::unistd::dup2(pidfd, 5).map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }
    let child = command.spawn()?;
    // Keep the handle's fds alive until the child owns its copies.
    drop(init);

    let stream = std::os::unix::net::UnixStream::connect(&socket_path)?;
    // The path served its purpose; the bound socket stays alive via fds.
    let _ = std::fs::remove_file(&socket_path);

    Ok((stream, child))
}
