//! Seekable byte stream over a script-side file
//!
//! Each read is one request across the boundary, sized to the caller's
//! request, and the cursor moves by the bytes actually returned. Reads on one
//! stream must not overlap: the inherent methods take `&mut self`, and the
//! `AsyncRead` implementation keeps at most one request in flight. Moving the
//! cursor drops that request, since its bytes belong to the old position.
//!
//! The transfer buffer is handed out of band in shared-buffer mode. A read
//! that is abandoned (cancelled, failed, or dropped mid-flight) may still get
//! written to later, so its buffer is never reused.

use crate::buffer::SharedBuffer;
use crate::error::{FileReaderError, Result};
use crate::handle::FileHandle;
use crate::protocol::FileInfo;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio_util::sync::CancellationToken;

type ReadFuture = Pin<Box<dyn Future<Output = Result<usize>> + Send>>;

struct InFlightRead {
    future: ReadFuture,
    buffer: SharedBuffer,
}

pub struct SeekableFileStream {
    handle: Arc<FileHandle>,
    position: u64,
    /// Reusable transfer buffer; empty after an abandoned read
    buffer: SharedBuffer,
    in_flight: Option<InFlightRead>,
    chunk_size: usize,
}

impl std::fmt::Debug for SeekableFileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekableFileStream")
            .field("file_ref", &self.handle.file_ref())
            .field("position", &self.position)
            .field("len", &self.len())
            .field("read_in_flight", &self.in_flight.is_some())
            .finish()
    }
}

impl SeekableFileStream {
    pub fn new(handle: FileHandle) -> Self {
        let chunk_size = handle.interop().config().chunk_size;
        Self {
            handle: Arc::new(handle),
            position: 0,
            buffer: SharedBuffer::default(),
            in_flight: None,
            chunk_size,
        }
    }

    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    pub fn info(&self) -> &FileInfo {
        self.handle.info()
    }

    /// File length from the metadata cached at open time
    pub fn len(&self) -> u64 {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor; positions past the end are allowed and read as EOF
    pub fn set_position(&mut self, position: u64) {
        self.abandon_poll_read();
        self.position = position;
    }

    /// Drop an unfinished `AsyncRead` request issued for the old cursor
    ///
    /// Its registry entry goes with it. The buffer it holds was already
    /// taken out of the stream, so a late write cannot reach a later read.
    fn abandon_poll_read(&mut self) {
        if self.in_flight.take().is_some() {
            tracing::debug!(
                "discarding unfinished poll read on file {}",
                self.handle.file_ref()
            );
        }
    }

    /// Take a transfer buffer of at least `count` bytes out of the stream
    fn take_buffer(&mut self, count: usize) -> SharedBuffer {
        let buffer = std::mem::take(&mut self.buffer);
        if buffer.len() >= count {
            buffer
        } else {
            SharedBuffer::new(count)
        }
    }

    /// Read up to `dst.len()` bytes at the cursor
    ///
    /// A single request carries at most `i32::MAX` bytes, so a larger
    /// destination gets a short read even before end-of-file.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.read_with_cancel(dst, &CancellationToken::new()).await
    }

    /// Read up to `dst.len()` bytes at the cursor, giving up when `cancel` fires
    ///
    /// Returns fewer bytes than requested only at end-of-file, and zero once
    /// the cursor is at or past it. The cursor is left alone on failure.
    pub async fn read_with_cancel(
        &mut self,
        dst: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.abandon_poll_read();
        let count = request_len(dst.len());
        if count == 0 {
            return Ok(0);
        }

        let buffer = self.take_buffer(count);
        let n = self
            .handle
            .read_at(&buffer, 0, self.position, count, cancel)
            .await?;
        let n = n.min(count);
        let copied = buffer.copy_to(0, &mut dst[..n]);
        self.position += copied as u64;
        self.buffer = buffer;
        Ok(copied)
    }

    /// Move the cursor and return its new value
    ///
    /// An unfinished `AsyncRead` request is dropped first, even if the seek
    /// itself is rejected.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.abandon_poll_read();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => offset_by(self.len(), delta),
            SeekFrom::Current(delta) => offset_by(self.position, delta),
        };
        let target = target.ok_or_else(|| {
            FileReaderError::InvalidArgument(format!(
                "seek to {:?} from position {} leaves the valid range",
                pos, self.position
            ))
        })?;
        self.position = target;
        Ok(target)
    }

    /// Dispose the underlying handle
    pub async fn dispose(mut self) -> Result<bool> {
        self.in_flight = None;
        self.handle.dispose().await
    }

    fn start_read(&mut self, count: usize) -> InFlightRead {
        let buffer = self.take_buffer(count);
        let handle = Arc::clone(&self.handle);
        let target = buffer.clone();
        let position = self.position;
        let future = Box::pin(async move {
            handle
                .read_at(&target, 0, position, count, &CancellationToken::new())
                .await
        });
        InFlightRead { future, buffer }
    }
}

/// Largest count one read request can carry
const MAX_REQUEST: usize = i32::MAX as usize;

fn request_len(dst_len: usize) -> usize {
    dst_len.min(MAX_REQUEST)
}

fn offset_by(base: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

impl AsyncRead for SeekableFileStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.in_flight.is_none() {
            let count = buf.remaining().min(this.chunk_size);
            if count == 0 {
                return Poll::Ready(Ok(()));
            }
            let read = this.start_read(count);
            this.in_flight = Some(read);
        }
        let Some(in_flight) = this.in_flight.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let result = ready!(in_flight.future.as_mut().poll(cx));
        let Some(InFlightRead { buffer, .. }) = this.in_flight.take() else {
            return Poll::Ready(Ok(()));
        };

        match result {
            Ok(n) => {
                // The caller may hand a smaller ReadBuf on the repeat poll;
                // whatever does not fit is read again next time.
                let n = n.min(buf.remaining());
                let copied = buffer.copy_to(0, buf.initialize_unfilled_to(n));
                buf.advance(copied);
                this.position += copied as u64;
                this.buffer = buffer;
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl AsyncSeek for SeekableFileStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        self.get_mut().seek(position)?;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}
