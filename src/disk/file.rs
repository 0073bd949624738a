//! [`BridgedFile`] wraps a standard `File` and routes positional I/O through
//! a [`DiskBridge`].

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

use super::DiskBridge;

pub struct BridgedFile {
    file: File,
    bridge: DiskBridge,
}

impl BridgedFile {
    pub fn new(file: File, bridge: DiskBridge) -> Self {
        BridgedFile { file, bridge }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn into_inner(self) -> File {
        self.file
    }

    /// Read into `buf` at `offset`. Returns the byte count and the buffer.
    pub async fn read_at(&self, buf: Vec<u8>, offset: u64) -> io::Result<(usize, Vec<u8>)> {
        self.bridge.pread(self.file.as_raw_fd(), buf, offset).await
    }

    pub async fn write_at(&self, buf: Vec<u8>, offset: u64) -> io::Result<(usize, Vec<u8>)> {
        self.bridge.pwrite(self.file.as_raw_fd(), buf, offset).await
    }

    pub async fn read_vectored_at(
        &self,
        bufs: Vec<Vec<u8>>,
        offset: u64,
    ) -> io::Result<(usize, Vec<Vec<u8>>)> {
        self.bridge.preadv(self.file.as_raw_fd(), bufs, offset).await
    }

    pub async fn write_vectored_at(
        &self,
        bufs: Vec<Vec<u8>>,
        offset: u64,
    ) -> io::Result<(usize, Vec<Vec<u8>>)> {
        self.bridge.pwritev(self.file.as_raw_fd(), bufs, offset).await
    }

    /// Write the whole buffer, issuing follow-up writes after short ones.
    pub async fn write_all_at(&self, mut buf: Vec<u8>, mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            let (n, rest) = self.write_at(buf, offset).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            buf = rest;
            buf.drain(..n);
            offset += n as u64;
        }
        Ok(())
    }

    pub async fn sync_all(&self) -> io::Result<()> {
        self.bridge.fsync(self.file.as_raw_fd()).await
    }
}
