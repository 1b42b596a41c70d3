//! Managed-side entry point for script-side files
//!
//! `FileReaderInterop` owns everything one reader needs: the script runtime,
//! the table of pending reads, the transfer strategy picked at construction,
//! and the set of file references it has opened. It is cheap to clone; all
//! clones share that state. Independent instances share nothing.

use crate::buffer::SharedBuffer;
use crate::config::{ConfigError, ReaderConfig};
use crate::error::{FileReaderError, Result};
use crate::handle::FileHandle;
use crate::protocol::{functions, ElementRef, FileInfo, FileRef};
use crate::registry::{CallbackIdGenerator, CorrelationRegistry};
use crate::runtime::{CallbackDispatcher, ScriptRuntime};
use crate::stream::SeekableFileStream;
use crate::transfer::{
    build_strategy, ReadRequest, ReadResult, TransferMode, TransferModeSelector, TransferStrategy,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct Inner {
    runtime: Arc<dyn ScriptRuntime>,
    config: ReaderConfig,
    selector: TransferModeSelector,
    strategy: Arc<dyn TransferStrategy>,
    pending: CorrelationRegistry<ReadResult>,
    /// References opened through this reader and not yet disposed
    open_refs: Mutex<HashSet<FileRef>>,
}

#[derive(Clone)]
pub struct FileReaderInterop {
    inner: Arc<Inner>,
}

impl fmt::Debug for FileReaderInterop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReaderInterop")
            .field("runtime", &"<dyn ScriptRuntime>")
            .field("mode", &self.transfer_mode())
            .field("pending", &self.inner.pending)
            .finish()
    }
}

impl FileReaderInterop {
    /// Create a reader with the default configuration
    pub fn new(runtime: Arc<dyn ScriptRuntime>) -> Self {
        Self::build(runtime, ReaderConfig::default())
    }

    /// Create a reader with an explicit configuration
    pub fn with_config(
        runtime: Arc<dyn ScriptRuntime>,
        config: ReaderConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(runtime, config))
    }

    fn build(runtime: Arc<dyn ScriptRuntime>, config: ReaderConfig) -> Self {
        let selector = TransferModeSelector::new(config.transfer_mode);
        let mode = selector.select(runtime.as_ref());
        let pending = CorrelationRegistry::new();
        let strategy = build_strategy(
            mode,
            Arc::clone(&runtime),
            pending.clone(),
            Arc::new(CallbackIdGenerator::new()),
        );

        Self {
            inner: Arc::new(Inner {
                runtime,
                config,
                selector,
                strategy,
                pending,
                open_refs: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Handle the script side uses to complete reads
    pub fn callbacks(&self) -> CallbackDispatcher {
        CallbackDispatcher::new(self.inner.pending.clone())
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.inner
            .selector
            .selected()
            .unwrap_or_else(|| self.inner.strategy.mode())
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.inner.config
    }

    /// Number of reads waiting for their completion callback
    pub fn pending_reads(&self) -> usize {
        self.inner.pending.len()
    }

    fn open_refs(&self) -> MutexGuard<'_, HashSet<FileRef>> {
        self.inner
            .open_refs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `file_ref` was opened here and not yet disposed
    pub fn is_open(&self, file_ref: FileRef) -> bool {
        self.open_refs().contains(&file_ref)
    }

    async fn call<T: DeserializeOwned>(&self, function: &str, args: Vec<Value>) -> Result<T> {
        let value = self
            .inner
            .runtime
            .invoke(function, args)
            .await
            .map_err(FileReaderError::host)?;
        serde_json::from_value(value)
            .map_err(|e| FileReaderError::Host(format!("unexpected result from {function}: {e}")))
    }

    /// Number of files on `element`, `None` if it has no file collection
    pub async fn get_file_count(&self, element: ElementRef) -> Result<Option<usize>> {
        let count: i64 = self
            .call(functions::GET_FILE_COUNT, vec![json!(element)])
            .await?;
        Ok(usize::try_from(count).ok())
    }

    /// Metadata of the file at `index` on `element`
    ///
    /// `None` if there is no collection or no file at that index.
    pub async fn get_file_info_from_element(
        &self,
        element: ElementRef,
        index: usize,
    ) -> Result<Option<FileInfo>> {
        let value: Value = self
            .call(
                functions::GET_FILE_INFO_FROM_ELEMENT,
                vec![json!(element), json!(index)],
            )
            .await?;
        parse_file_info(value)
    }

    /// Metadata of an open file, fetched again from the script side
    pub async fn get_file_info_from_reference(&self, file_ref: FileRef) -> Result<FileInfo> {
        if !self.is_open(file_ref) {
            return Err(FileReaderError::InvalidReference(file_ref));
        }
        let value: Value = self
            .call(functions::GET_FILE_INFO_FROM_REFERENCE, vec![json!(file_ref)])
            .await?;
        parse_file_info(value)?.ok_or(FileReaderError::InvalidReference(file_ref))
    }

    /// Open the file at `index` on `element` for reading
    pub async fn open_read(&self, element: ElementRef, index: usize) -> Result<FileRef> {
        let count = self
            .get_file_count(element)
            .await?
            .ok_or(FileReaderError::NoFileCollection)?;
        if index >= count {
            return Err(FileReaderError::IndexOutOfRange { index, count });
        }

        let file_ref: FileRef = self
            .call(functions::OPEN_READ, vec![json!(element), json!(index)])
            .await?;
        self.open_refs().insert(file_ref);
        tracing::debug!("opened file {} from element index {}", file_ref, index);
        Ok(file_ref)
    }

    /// Release `file_ref` on the script side
    ///
    /// The reference is invalid for reads as soon as this is called, whatever
    /// the script side answers.
    pub async fn dispose(&self, file_ref: FileRef) -> Result<bool> {
        if !self.open_refs().remove(&file_ref) {
            return Err(FileReaderError::InvalidReference(file_ref));
        }
        let released: bool = self.call(functions::DISPOSE, vec![json!(file_ref)]).await?;
        tracing::debug!("disposed file {} (released: {})", file_ref, released);
        Ok(released)
    }

    /// Open a handle to the file at `index` on `element`
    pub async fn open(&self, element: ElementRef, index: usize) -> Result<FileHandle> {
        FileHandle::open(self.clone(), element, index).await
    }

    /// Open the file at `index` on `element` as a seekable stream
    pub async fn open_file_stream(
        &self,
        element: ElementRef,
        index: usize,
    ) -> Result<SeekableFileStream> {
        Ok(SeekableFileStream::new(self.open(element, index).await?))
    }

    /// Start collecting dropped files on `element`
    ///
    /// With `additive`, each drop is appended to what earlier drops left.
    pub async fn register_drop_events(&self, element: ElementRef, additive: bool) -> Result<bool> {
        self.call(
            functions::REGISTER_DROP_EVENTS,
            vec![json!(element), json!(additive)],
        )
        .await
    }

    pub async fn unregister_drop_events(&self, element: ElementRef) -> Result<bool> {
        self.call(functions::UNREGISTER_DROP_EVENTS, vec![json!(element)])
            .await
    }

    /// Forget the files currently selected on or dropped onto `element`
    pub async fn clear_value(&self, element: ElementRef) -> Result<()> {
        let _: Value = self
            .call(functions::CLEAR_VALUE, vec![json!(element)])
            .await?;
        Ok(())
    }

    /// Read up to `count` bytes of `file_ref` at `position`
    ///
    /// The bytes land in `buffer[buffer_offset..]`. Returns the number read,
    /// which is less than `count` only at end-of-file and zero when
    /// `position` is at or past it. In shared-buffer mode `buffer` is written
    /// from outside while the read is pending.
    ///
    /// Counts travel as 32-bit signed integers; a `count` above `i32::MAX`
    /// fails with `InvalidArgument` before anything is sent.
    pub async fn read(
        &self,
        file_ref: FileRef,
        buffer: &SharedBuffer,
        buffer_offset: usize,
        position: u64,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if !self.is_open(file_ref) {
            return Err(FileReaderError::InvalidReference(file_ref));
        }
        let wire_count = u32::try_from(count)
            .ok()
            .filter(|c| *c <= i32::MAX as u32)
            .ok_or_else(|| {
                FileReaderError::InvalidArgument(format!("read count {count} is too large"))
            })?;
        let fits = buffer_offset
            .checked_add(count)
            .is_some_and(|end| end <= buffer.len());
        if !fits {
            return Err(FileReaderError::InvalidArgument(format!(
                "{} bytes at offset {} do not fit a {}-byte buffer",
                count,
                buffer_offset,
                buffer.len()
            )));
        }
        if count == 0 {
            return Ok(0);
        }

        let request = ReadRequest {
            file_ref,
            position,
            count: wire_count,
            buffer_offset,
        };
        let bytes_read = self.inner.strategy.read(request, buffer, cancel).await?;
        tracing::trace!(
            "read {} of {} bytes from file {} at {}",
            bytes_read,
            count,
            file_ref,
            position
        );
        Ok(bytes_read)
    }
}

/// Metadata may come back as a record or as its JSON text
fn parse_file_info(value: Value) -> Result<Option<FileInfo>> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::String(text) if text.trim().is_empty() || text.trim() == "null" => return Ok(None),
        Value::String(text) => serde_json::from_str(&text),
        other => serde_json::from_value(other),
    };
    parsed
        .map(Some)
        .map_err(|e| FileReaderError::Host(format!("malformed file info: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_info_forms() {
        let record = json!({"name": "a.txt", "size": 3, "type": "text/plain", "lastModified": 5});
        let from_record = parse_file_info(record.clone()).unwrap().unwrap();
        let from_text = parse_file_info(Value::String(record.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(from_record, from_text);
        assert_eq!(from_record.size, 3);

        assert_eq!(parse_file_info(Value::Null).unwrap(), None);
        assert_eq!(parse_file_info(json!("null")).unwrap(), None);
        assert!(parse_file_info(json!({"size": "big"})).is_err());
    }
}
