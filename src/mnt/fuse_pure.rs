//! Mounting without libfuse: `mount(2)` when permitted, the fusermount helper otherwise.

use log::{debug, error, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use nix::unistd::{getgid, getuid};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Command, Stdio};

use super::mount_options::{option_to_string, options_to_string, MountOption};

const FUSERMOUNT_BIN: &str = "fusermount";
const FUSERMOUNT3_BIN: &str = "fusermount3";
const FUSERMOUNT_COMM_ENV: &str = "_FUSE_COMMFD";
const FUSE_DEVICE: &str = "/dev/fuse";

pub(crate) fn fuse_mount_pure(
    mountpoint: &Path,
    options: &[MountOption],
) -> io::Result<(File, Option<UnixStream>)> {
    if options.contains(&MountOption::AutoUnmount) {
        // Auto unmount needs a helper process that outlives us
        return fuse_mount_fusermount(mountpoint, options);
    }
    match fuse_mount_sys(mountpoint, options)? {
        Some(file) => Ok((file, None)),
        None => fuse_mount_fusermount(mountpoint, options),
    }
}

pub(crate) fn fuse_unmount_pure(mountpoint: &Path) {
    match umount2(mountpoint, MntFlags::MNT_DETACH) {
        Ok(()) => return,
        // Already gone, e.g. unmounted from outside
        Err(Errno::EINVAL) => return,
        Err(Errno::EPERM) => {}
        Err(err) => {
            warn!("umount of {} failed: {err}", mountpoint.display());
            return;
        }
    }
    let status = Command::new(detect_fusermount_bin())
        .arg("-u")
        .arg("-q")
        .arg("-z")
        .arg("--")
        .arg(mountpoint)
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("fusermount -u {} exited with {status}", mountpoint.display()),
        Err(err) => error!("Failed to run fusermount: {err}"),
    }
}

fn detect_fusermount_bin() -> String {
    for name in [FUSERMOUNT3_BIN, FUSERMOUNT_BIN] {
        if Command::new(name)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
        {
            return name.to_string();
        }
    }
    // Default to fusermount3
    FUSERMOUNT3_BIN.to_string()
}

/// Mount flags and the comma separated fuse data string for `mount(2)`
fn mount_args(options: &[MountOption]) -> (MsFlags, Vec<String>) {
    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    let mut data = Vec::new();
    for option in options {
        match option {
            MountOption::RO => flags.insert(MsFlags::MS_RDONLY),
            MountOption::RW => flags.remove(MsFlags::MS_RDONLY),
            MountOption::Dev => flags.remove(MsFlags::MS_NODEV),
            MountOption::NoDev => flags.insert(MsFlags::MS_NODEV),
            MountOption::Suid => flags.remove(MsFlags::MS_NOSUID),
            MountOption::NoSuid => flags.insert(MsFlags::MS_NOSUID),
            MountOption::Exec => flags.remove(MsFlags::MS_NOEXEC),
            MountOption::NoExec => flags.insert(MsFlags::MS_NOEXEC),
            MountOption::Atime => flags.remove(MsFlags::MS_NOATIME),
            MountOption::NoAtime => flags.insert(MsFlags::MS_NOATIME),
            // Passed to mount(2) as the source and type instead
            MountOption::FSName(_) | MountOption::Subtype(_) | MountOption::AutoUnmount => {}
            MountOption::AllowOther
            | MountOption::AllowRoot
            | MountOption::DefaultPermissions
            | MountOption::CUSTOM(_) => data.push(option_to_string(option)),
        }
    }
    (flags, data)
}

/// Returns `Ok(None)` when the caller lacks the privilege to mount directly
fn fuse_mount_sys(mountpoint: &Path, options: &[MountOption]) -> io::Result<Option<File>> {
    let file = match OpenOptions::new().read(true).write(true).open(FUSE_DEVICE) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() == ErrorKind::NotFound {
                error!("{FUSE_DEVICE} not found. Try 'modprobe fuse'");
            }
            return Err(err);
        }
    };
    let root_mode = std::fs::metadata(mountpoint)?.permissions().mode() & libc::S_IFMT;

    let (flags, extra) = mount_args(options);
    let mut data = vec![
        format!("fd={}", file.as_raw_fd()),
        format!("rootmode={root_mode:o}"),
        format!("user_id={}", getuid()),
        format!("group_id={}", getgid()),
    ];
    data.extend(extra);
    let data = data.join(",");

    let mut source = FUSE_DEVICE.to_string();
    let mut fstype = "fuse".to_string();
    for option in options {
        match option {
            MountOption::FSName(name) => source = name.clone(),
            MountOption::Subtype(subtype) => fstype = format!("fuse.{subtype}"),
            _ => {}
        }
    }

    debug!("mount(2) {source} on {} type {fstype}: {data}", mountpoint.display());
    match mount(
        Some(source.as_str()),
        mountpoint,
        Some(fstype.as_str()),
        flags,
        Some(data.as_str()),
    ) {
        Ok(()) => Ok(Some(file)),
        Err(Errno::EPERM) => {
            debug!("Not permitted to mount directly, falling back to fusermount");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn fuse_mount_fusermount(
    mountpoint: &Path,
    options: &[MountOption],
) -> io::Result<(File, Option<UnixStream>)> {
    let (child_socket, receive_socket) = UnixStream::pair()?;
    // The helper inherits its end of the socket across exec
    fcntl(child_socket.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;

    let auto_unmount = options.contains(&MountOption::AutoUnmount);
    let mut builder = Command::new(detect_fusermount_bin());
    if auto_unmount {
        // The helper outlives this call, so it must not write into pipes nobody drains
        builder.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    } else {
        builder.stdout(Stdio::piped()).stderr(Stdio::piped());
    }
    if !options.is_empty() {
        builder.arg("-o").arg(options_to_string(options));
    }
    builder
        .arg("--")
        .arg(mountpoint)
        .env(FUSERMOUNT_COMM_ENV, child_socket.as_raw_fd().to_string());
    let fusermount_child = builder.spawn()?;
    drop(child_socket);

    let file = match receive_fusermount_message(&receive_socket) {
        Ok(file) => file,
        Err(err) => {
            let output = fusermount_child.wait_with_output()?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("fusermount failed ({}): {}", output.status, stderr.trim());
            return Err(io::Error::new(
                err.kind(),
                format!("fusermount failed: {}", stderr.trim()),
            ));
        }
    };
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

    if auto_unmount {
        // fusermount keeps running until the socket closes, then unmounts
        return Ok((file, Some(receive_socket)));
    }
    drop(receive_socket);
    let output = fusermount_child.wait_with_output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            ErrorKind::Other,
            format!(
                "fusermount exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok((file, None))
}

/// Receives the FUSE device fd that fusermount passes back with `SCM_RIGHTS`
fn receive_fusermount_message(socket: &UnixStream) -> io::Result<File> {
    let mut buf = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg = nix::cmsg_space!(RawFd);
    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg),
        MsgFlags::empty(),
    )?;
    if msg.bytes == 0 {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            "fusermount closed the socket without sending a file descriptor",
        ));
    }
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // SAFETY: the kernel just installed this descriptor for us, nothing else owns it
                return Ok(unsafe { File::from_raw_fd(fd) });
            }
        }
    }
    Err(io::Error::new(
        ErrorKind::InvalidData,
        "fusermount sent no file descriptor",
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::sys::socket::{sendmsg, ControlMessage};
    use std::io::{IoSlice, Read, Seek, Write};

    #[test]
    fn read_only_mount_args() {
        let (flags, data) = mount_args(&[
            MountOption::RO,
            MountOption::FSName("hello".into()),
            MountOption::AllowOther,
            MountOption::Suid,
        ]);
        assert!(flags.contains(MsFlags::MS_RDONLY | MsFlags::MS_NODEV));
        assert!(!flags.contains(MsFlags::MS_NOSUID));
        assert_eq!(data, vec!["allow_other".to_string()]);
    }

    #[test]
    fn receives_passed_descriptor() {
        let (helper, ours) = UnixStream::pair().unwrap();
        let mut passed = tempfile::tempfile().unwrap();
        passed.write_all(b"fd").unwrap();
        let fds = [passed.as_raw_fd()];
        sendmsg::<()>(
            helper.as_raw_fd(),
            &[IoSlice::new(&[0])],
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();

        let mut received = receive_fusermount_message(&ours).unwrap();
        received.rewind().unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "fd");
    }

    #[test]
    fn closed_socket_is_an_error() {
        let (helper, ours) = UnixStream::pair().unwrap();
        drop(helper);
        let err = receive_fusermount_message(&ours).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
