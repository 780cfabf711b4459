//! OS wake primitive: an eventfd, or a pipe pair where eventfd is unavailable
//!
//! Both flavours expose one pollable read descriptor. A "token" is one
//! eventfd increment or one byte written to the pipe; reading returns how many
//! tokens were drained by that read.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Kernel object used to carry wakeups between threads
#[derive(Debug)]
pub(crate) enum WakeFd {
    Event(File),
    Pipe { reader: File, writer: File },
}

impl WakeFd {
    /// Prefer eventfd and fall back to a pipe
    pub(crate) fn new(nonblocking: bool) -> io::Result<Self> {
        match Self::eventfd(nonblocking) {
            Ok(fd) => Ok(fd),
            Err(e) => {
                log::debug!("eventfd unavailable ({}), falling back to pipe", e);
                Self::pipe(nonblocking)
            }
        }
    }

    pub(crate) fn eventfd(nonblocking: bool) -> io::Result<Self> {
        let mut flags = libc::EFD_CLOEXEC;
        if nonblocking {
            flags |= libc::EFD_NONBLOCK;
        }

        // SAFETY: eventfd has no memory-safety preconditions
        let fd = unsafe { libc::eventfd(0, flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: fd was just created and is owned by nobody else
        Ok(Self::Event(unsafe { File::from_raw_fd(fd) }))
    }

    pub(crate) fn pipe(nonblocking: bool) -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        let mut flags = libc::O_CLOEXEC;
        if nonblocking {
            flags |= libc::O_NONBLOCK;
        }

        // SAFETY: fds points at two writable c_ints
        if unsafe { libc::pipe2(fds.as_mut_ptr(), flags) } < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: both descriptors were just created by pipe2 and are unowned
        let (reader, writer) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
        Ok(Self::Pipe { reader, writer })
    }

    /// Descriptor that becomes readable once a token is pending
    pub(crate) fn fd(&self) -> RawFd {
        match self {
            Self::Event(file) => file.as_raw_fd(),
            Self::Pipe { reader, .. } => reader.as_raw_fd(),
        }
    }

    /// Write exactly one token
    pub(crate) fn write_token(&self) -> io::Result<()> {
        match self {
            Self::Event(file) => {
                let n = (&*file).write(&1u64.to_ne_bytes())?;
                if n != std::mem::size_of::<u64>() {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "short eventfd write"));
                }
            }
            Self::Pipe { writer, .. } => {
                if (&*writer).write(b"x")? != 1 {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "short pipe write"));
                }
            }
        }
        Ok(())
    }

    /// Read once and return the number of tokens consumed
    ///
    /// Blocks on a blocking descriptor until at least one token is present.
    pub(crate) fn read_tokens(&self) -> io::Result<usize> {
        match self {
            Self::Event(file) => {
                let mut buf = [0u8; 8];
                if (&*file).read(&mut buf)? != buf.len() {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short eventfd read"));
                }
                Ok(u64::from_ne_bytes(buf) as usize)
            }
            Self::Pipe { reader, .. } => {
                let mut buf = [0u8; 10];
                match (&*reader).read(&mut buf)? {
                    0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed")),
                    n => Ok(n),
                }
            }
        }
    }

    /// Drain every pending token without blocking. Only meaningful on a
    /// non-blocking descriptor.
    pub(crate) fn drain(&self) {
        loop {
            match self.read_tokens() {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_tokens_accumulate() {
        let wake = WakeFd::eventfd(true).unwrap();
        wake.write_token().unwrap();
        wake.write_token().unwrap();
        assert_eq!(wake.read_tokens().unwrap(), 2);
        assert_eq!(
            wake.read_tokens().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_pipe_tokens_are_bytes() {
        let wake = WakeFd::pipe(true).unwrap();
        for _ in 0..3 {
            wake.write_token().unwrap();
        }
        assert_eq!(wake.read_tokens().unwrap(), 3);
    }

    #[test]
    fn test_drain_empties_descriptor() {
        let wake = WakeFd::pipe(true).unwrap();
        for _ in 0..25 {
            wake.write_token().unwrap();
        }
        wake.drain();
        assert_eq!(
            wake.read_tokens().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }
}
