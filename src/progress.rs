use std::io::{self, Read, Write};
use std::path::Path;

use crate::errors::StoreError;

pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Wraps a reader and reports the cumulative byte count after every read.
pub struct ProgressReader<R, F> {
    inner: R,
    transferred: u64,
    on_progress: F,
}

impl<R, F> ProgressReader<R, F>
where
    R: Read,
    F: FnMut(u64),
{
    pub fn new(inner: R, on_progress: F) -> Self {
        Self {
            inner,
            transferred: 0,
            on_progress,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

impl<R, F> Read for ProgressReader<R, F>
where
    R: Read,
    F: FnMut(u64),
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.transferred = self.transferred.saturating_add(n as u64);
            (self.on_progress)(self.transferred);
        }
        Ok(n)
    }
}

#[derive(Debug)]
pub enum CopyFailure {
    Read(io::Error),
    Write(io::Error),
}

impl CopyFailure {
    pub fn into_store_error(
        self,
        operation: &'static str,
        source: &Path,
        destination: &Path,
    ) -> StoreError {
        match self {
            Self::Read(err) => StoreError::read(operation, source, err),
            Self::Write(err) => StoreError::write(operation, destination, err),
        }
    }
}

/// Streams `reader` into `writer` through a 32 KiB buffer. The reader is
/// wrapped in a [`ProgressReader`] that calls `on_progress(transferred, total)`
/// for every chunk it hands out.
///
/// A source that yields no bytes still gets one `(0, total)` callback so
/// callers always observe a final record.
pub fn copy_with_progress<R, W>(
    reader: R,
    writer: &mut W,
    total: u64,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<u64, CopyFailure>
where
    R: Read,
    W: Write,
{
    let mut counted = ProgressReader::new(reader, |transferred| on_progress(transferred, total));
    let mut buffer = vec![0_u8; COPY_BUFFER_SIZE];
    loop {
        let read = match counted.read(buffer.as_mut_slice()) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(CopyFailure::Read(err)),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(CopyFailure::Write)?;
    }
    writer.flush().map_err(CopyFailure::Write)?;

    let transferred = counted.transferred();
    drop(counted);
    if transferred == 0 {
        on_progress(0, total);
    }
    Ok(transferred)
}
