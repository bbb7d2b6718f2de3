//! SCM_RIGHTS file-descriptor passing over `AF_UNIX` sockets.
//!
//! Used in both directions of the hot-restart hand-off: the `getxfd`
//! control command sends a listener fd to a connecting management client,
//! and startup receives one back from a previous instance's control socket
//! when `--getfd-socket` is given.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

/// Send `data` with `fd` attached as `SCM_RIGHTS` ancillary data, to
/// whatever destination `sock` is already connected to.
///
/// The kernel duplicates the descriptor into the receiving process; the
/// caller's own copy of `fd` is unaffected and remains open afterward.
pub fn send_with_fd(sock: &impl AsRawFd, data: &[u8], fd: RawFd) -> io::Result<()> {
    send_with_fd_impl(sock.as_raw_fd(), std::ptr::null(), 0, data, fd)
}

/// Like [`send_with_fd`], but for an unconnected `SOCK_DGRAM` socket:
/// addresses the message at `dest`, a pathname-bound Unix socket, the way
/// the control protocol replies to the peer address recovered from
/// `recvfrom`.
pub fn send_with_fd_to(sock: &impl AsRawFd, dest: &Path, data: &[u8], fd: RawFd) -> io::Result<()> {
    let path_bytes = dest.as_os_str().as_bytes();
    if path_bytes.len() >= 108 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "unix socket path too long"));
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (i, b) in path_bytes.iter().enumerate() {
        addr.sun_path[i] = *b as libc::c_char;
    }
    let addr_len = (std::mem::size_of::<libc::sa_family_t>() + path_bytes.len() + 1) as libc::socklen_t;

    send_with_fd_impl(
        sock.as_raw_fd(),
        &addr as *const libc::sockaddr_un as *const libc::c_void,
        addr_len,
        data,
        fd,
    )
}

fn send_with_fd_impl(
    raw_fd: RawFd,
    msg_name: *const libc::c_void,
    msg_namelen: libc::socklen_t,
    data: &[u8],
    fd: RawFd,
) -> io::Result<()> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    let mut msg = libc::msghdr {
        msg_name: msg_name as *mut libc::c_void,
        msg_namelen,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_space as _,
        msg_flags: 0,
    };

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        std::ptr::write_unaligned(data_ptr, fd);
    }

    let n = unsafe { libc::sendmsg(raw_fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one message from `sock`, returning its data payload and any
/// file descriptor carried as `SCM_RIGHTS` ancillary data.
///
/// Only the first descriptor in the ancillary data is returned, which is
/// all this crate's protocol ever sends in one datagram.
pub fn recv_with_fd(sock: &impl AsRawFd, data_buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: data_buf.len(),
    };

    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fd = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_ptr = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                let raw = std::ptr::read_unaligned(data_ptr);
                fd = Some(OwnedFd::from_raw_fd(raw));
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, fd))
}
