//! Disk operation descriptors.
//!
//! An [`Operation`] owns every buffer the kernel may touch, so it can outlive
//! the task that issued it when that task gives up early.

use std::io;
use std::os::fd::RawFd;

use io_uring::{opcode, squeue, types};

/// Largest iovec array accepted by vectored operations.
const IOV_MAX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    ReadV,
    WriteV,
    Fsync,
}

/// Vectored buffers plus the iovec table pointing into them.
///
/// The table points at the heap storage of `bufs`, which does not move when
/// the `Vectored` value itself moves.
struct Vectored {
    bufs: Vec<Vec<u8>>,
    iovecs: Box<[libc::iovec]>,
}

impl Vectored {
    fn new(mut bufs: Vec<Vec<u8>>) -> Self {
        let iovecs = bufs
            .iter_mut()
            .map(|b| libc::iovec {
                iov_base: b.as_mut_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        Vectored { bufs, iovecs }
    }

    fn total_len(&self) -> usize {
        self.bufs.iter().map(Vec::len).sum()
    }
}

enum Payload {
    Read(Vec<u8>),
    Write(Vec<u8>),
    ReadV(Vectored),
    WriteV(Vectored),
    Fsync,
}

/// One disk request: kind, descriptor, owned buffers and file offset.
pub struct Operation {
    fd: RawFd,
    offset: u64,
    payload: Payload,
}

impl Operation {
    /// Read `buf.len()` bytes at `offset` into `buf`.
    pub fn read(fd: RawFd, buf: Vec<u8>, offset: u64) -> Self {
        Operation {
            fd,
            offset,
            payload: Payload::Read(buf),
        }
    }

    pub fn write(fd: RawFd, buf: Vec<u8>, offset: u64) -> Self {
        Operation {
            fd,
            offset,
            payload: Payload::Write(buf),
        }
    }

    /// Scatter-read into `bufs`, filled in order starting at `offset`.
    pub fn read_vectored(fd: RawFd, bufs: Vec<Vec<u8>>, offset: u64) -> Self {
        Operation {
            fd,
            offset,
            payload: Payload::ReadV(Vectored::new(bufs)),
        }
    }

    pub fn write_vectored(fd: RawFd, bufs: Vec<Vec<u8>>, offset: u64) -> Self {
        Operation {
            fd,
            offset,
            payload: Payload::WriteV(Vectored::new(bufs)),
        }
    }

    pub fn fsync(fd: RawFd) -> Self {
        Operation {
            fd,
            offset: 0,
            payload: Payload::Fsync,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self.payload {
            Payload::Read(_) => OpKind::Read,
            Payload::Write(_) => OpKind::Write,
            Payload::ReadV(_) => OpKind::ReadV,
            Payload::WriteV(_) => OpKind::WriteV,
            Payload::Fsync => OpKind::Fsync,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total number of bytes the operation asks for.
    pub fn len(&self) -> usize {
        match &self.payload {
            Payload::Read(b) | Payload::Write(b) => b.len(),
            Payload::ReadV(v) | Payload::WriteV(v) => v.total_len(),
            Payload::Fsync => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject requests the kernel would refuse, before anything is queued.
    pub(crate) fn validate(&self) -> io::Result<()> {
        if self.fd < 0 || unsafe { libc::fcntl(self.fd, libc::F_GETFD) } < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if self.offset > i64::MAX as u64 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let too_large = match &self.payload {
            Payload::Read(b) | Payload::Write(b) => b.len() > u32::MAX as usize,
            Payload::ReadV(v) | Payload::WriteV(v) => {
                v.iovecs.len() > IOV_MAX || v.total_len() > isize::MAX as usize
            }
            Payload::Fsync => false,
        };
        if too_large {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    /// Build the submission entry. The caller sets `user_data`.
    pub(crate) fn prepare(&mut self) -> squeue::Entry {
        let fd = types::Fd(self.fd);
        match &mut self.payload {
            Payload::Read(b) => opcode::Read::new(fd, b.as_mut_ptr(), b.len() as u32)
                .offset(self.offset)
                .build(),
            Payload::Write(b) => opcode::Write::new(fd, b.as_ptr(), b.len() as u32)
                .offset(self.offset)
                .build(),
            Payload::ReadV(v) => opcode::Readv::new(fd, v.iovecs.as_ptr(), v.iovecs.len() as u32)
                .offset(self.offset)
                .build(),
            Payload::WriteV(v) => {
                opcode::Writev::new(fd, v.iovecs.as_ptr(), v.iovecs.len() as u32)
                    .offset(self.offset)
                    .build()
            }
            Payload::Fsync => opcode::Fsync::new(fd).build(),
        }
    }

    /// Give back the single buffer of a read or write; empty otherwise.
    pub fn into_buffer(self) -> Vec<u8> {
        match self.payload {
            Payload::Read(b) | Payload::Write(b) => b,
            Payload::ReadV(v) | Payload::WriteV(v) => v.bufs.into_iter().flatten().collect(),
            Payload::Fsync => Vec::new(),
        }
    }

    /// Give back the buffers of a vectored operation.
    pub fn into_buffers(self) -> Vec<Vec<u8>> {
        match self.payload {
            Payload::ReadV(v) | Payload::WriteV(v) => v.bufs,
            Payload::Read(b) | Payload::Write(b) => vec![b],
            Payload::Fsync => Vec::new(),
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind())
            .field("fd", &self.fd)
            .field("offset", &self.offset)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn negative_descriptor_is_ebadf() {
        let err = Operation::read(-1, vec![0; 8], 0).validate().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn too_many_iovecs_is_einval() {
        let file = tempfile::tempfile().unwrap();
        let bufs = vec![vec![0u8; 1]; IOV_MAX + 1];
        let err = Operation::read_vectored(file.as_raw_fd(), bufs, 0)
            .validate()
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn vectored_lengths_and_buffers() {
        let file = tempfile::tempfile().unwrap();
        let op = Operation::write_vectored(file.as_raw_fd(), vec![vec![1; 3], vec![2; 5]], 4);
        assert!(op.validate().is_ok());
        assert_eq!(op.kind(), OpKind::WriteV);
        assert_eq!(op.len(), 8);
        assert_eq!(op.into_buffers(), vec![vec![1; 3], vec![2; 5]]);
    }
}
