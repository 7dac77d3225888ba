use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use tokio::net::UnixStream;
use tokio::process::Command;

/// Descriptor number the segment channel lands on inside a worker.
pub const CHILD_IPC_FD: RawFd = 3;

/// Create the channel for one child: the async end stays in the parent, the
/// blocking end is handed to [`inherit_into`] and dropped after spawn.
pub fn channel_pair() -> io::Result<(UnixStream, StdUnixStream)> {
    let (parent, child) = StdUnixStream::pair()?;
    parent.set_nonblocking(true)?;
    Ok((UnixStream::from_std(parent)?, child))
}

/// Arrange for `child_end` to appear as `target` in the spawned process.
pub fn inherit_into(command: &mut Command, child_end: &StdUnixStream, target: RawFd) {
    let source = child_end.as_raw_fd();

    // SAFETY: the closure only calls async-signal-safe libc functions on
    // descriptors owned by the forked child.
    unsafe {
        command.pre_exec(move || {
            if source == target {
                let flags = libc::fcntl(target, libc::F_GETFD);
                if flags < 0 || libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(source, target) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Adopt a channel descriptor inherited from the parent. Must run inside a
/// tokio runtime.
pub fn from_inherited_fd(fd: RawFd) -> io::Result<UnixStream> {
    if fd < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid ipc descriptor {}", fd),
        ));
    }

    // SAFETY: the descriptor was installed for this process by its parent and
    // nothing else in the process owns it.
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// Parse a descriptor number from an environment value.
pub fn parse_fd(raw: &str) -> io::Result<RawFd> {
    raw.trim().parse::<RawFd>().map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid ipc descriptor '{}': {}", raw, err),
        )
    })
}
