//! Local proxy for a file that lives in the script environment

use crate::buffer::SharedBuffer;
use crate::error::{FileReaderError, Result};
use crate::interop::FileReaderInterop;
use crate::protocol::{ElementRef, FileInfo, FileRef};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// An open script-side file with its metadata captured at open time
///
/// Dispose it explicitly with [`FileHandle::dispose`]. A handle dropped
/// without that schedules the release on the current tokio runtime, if any.
#[derive(Debug)]
pub struct FileHandle {
    interop: FileReaderInterop,
    file_ref: FileRef,
    info: FileInfo,
    disposed: AtomicBool,
}

impl FileHandle {
    pub(crate) async fn open(
        interop: FileReaderInterop,
        element: ElementRef,
        index: usize,
    ) -> Result<Self> {
        let file_ref = interop.open_read(element, index).await?;
        let info = match interop.get_file_info_from_reference(file_ref).await {
            Ok(info) => info,
            Err(e) => {
                if let Err(dispose_err) = interop.dispose(file_ref).await {
                    tracing::debug!("releasing file {} failed: {}", file_ref, dispose_err);
                }
                return Err(e);
            }
        };

        tracing::debug!(
            "file handle {} for '{}' ({} bytes)",
            file_ref,
            info.name,
            info.size
        );
        Ok(Self {
            interop,
            file_ref,
            info,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn file_ref(&self) -> FileRef {
        self.file_ref
    }

    /// Metadata captured when the handle was opened
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// File size in bytes, from the cached metadata
    pub fn len(&self) -> u64 {
        self.info.size
    }

    pub fn is_empty(&self) -> bool {
        self.info.size == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn interop(&self) -> &FileReaderInterop {
        &self.interop
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(FileReaderError::InvalidReference(self.file_ref))
        } else {
            Ok(())
        }
    }

    /// Fetch the metadata again and replace the cached copy
    pub async fn refresh_info(&mut self) -> Result<&FileInfo> {
        self.ensure_live()?;
        self.info = self
            .interop
            .get_file_info_from_reference(self.file_ref)
            .await?;
        Ok(&self.info)
    }

    /// Read up to `count` bytes at `position` into `buffer[buffer_offset..]`
    pub async fn read_at(
        &self,
        buffer: &SharedBuffer,
        buffer_offset: usize,
        position: u64,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.ensure_live()?;
        self.interop
            .read(self.file_ref, buffer, buffer_offset, position, count, cancel)
            .await
    }

    /// Release the script-side reference
    ///
    /// Every later read or dispose on this handle fails with
    /// `InvalidReference`.
    pub async fn dispose(&self) -> Result<bool> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(FileReaderError::InvalidReference(self.file_ref));
        }
        self.interop.dispose(self.file_ref).await
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.is_disposed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                "file handle {} dropped outside a runtime without dispose",
                self.file_ref
            );
            return;
        };
        let interop = self.interop.clone();
        let file_ref = self.file_ref;
        runtime.spawn(async move {
            if let Err(e) = interop.dispose(file_ref).await {
                tracing::debug!("releasing dropped file handle {} failed: {}", file_ref, e);
            }
        });
    }
}
