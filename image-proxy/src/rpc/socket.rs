use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// A `SOCK_SEQPACKET` Unix socket driven by the tokio reactor.
///
/// Each send is one message and each receive returns one whole message, with
/// up to one file descriptor riding along.
#[derive(Debug)]
pub struct SeqPacket {
    inner: AsyncFd<OwnedFd>,
}

impl SeqPacket {
    /// Take over a connected seqpacket socket.
    ///
    /// The socket is switched to non-blocking mode. Must be called from
    /// within a tokio runtime.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;

        Ok(SeqPacket {
            inner: AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?,
        })
    }

    /// A connected pair of sockets.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    /// Send one message, optionally passing a descriptor with it.
    pub async fn send(&self, message: &[u8], fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        let fds: Vec<RawFd> = fd.iter().map(|fd| fd.as_raw_fd()).collect();

        self.inner
            .async_io(Interest::WRITABLE, |socket| {
                let iov = [IoSlice::new(message)];
                let rights = [ControlMessage::ScmRights(&fds)];
                let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
                let sent = sendmsg::<UnixAddr>(
                    socket.as_raw_fd(),
                    &iov,
                    cmsgs,
                    MsgFlags::MSG_NOSIGNAL,
                    None,
                )?;
                if sent != message.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "message was not sent whole",
                    ));
                }
                Ok(())
            })
            .await
    }

    /// Receive one message into `buf`, and the descriptor sent with it.
    ///
    /// A zero-length message is what a closed peer looks like. A message
    /// longer than `buf` fails with [`io::ErrorKind::InvalidData`]; it is
    /// discarded whole and the socket stays usable.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
        self.inner
            .async_io(Interest::READABLE, |socket| {
                let mut iov = [IoSliceMut::new(buf)];
                let mut space = nix::cmsg_space!([RawFd; 1]);
                let message = recvmsg::<UnixAddr>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )?;

                let mut received = Vec::new();
                for cmsg in message.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        received.extend(fds);
                    }
                }
                let mut received = received.into_iter().map(adopt);
                let fd = received.next();
                // Anything beyond the first descriptor is closed as it drops.
                drop(received);

                if message.flags.contains(MsgFlags::MSG_TRUNC) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "message larger than the receive buffer",
                    ));
                }
                Ok((message.bytes, fd))
            })
            .await
    }
}

impl AsFd for SeqPacket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.get_ref().as_fd()
    }
}

#[allow(unsafe_code)]
fn adopt(fd: RawFd) -> OwnedFd {
    // SAFETY: the kernel just installed this descriptor for us via SCM_RIGHTS,
    // nothing else owns it.
    unsafe { OwnedFd::from_raw_fd(fd) }
}
