//! In-process script side backed by byte vectors
//!
//! Behaves like the browser component the reader talks to: file inputs and
//! drop zones hold file lists, `openRead` hands out references, and reads are
//! answered asynchronously through the reader's callbacks. Reads are clamped
//! the way `Blob.slice` clamps, so a range past the end yields zero bytes.
//!
//! Useful for tests and for the `blobcat` demo: callback delivery can be
//! delayed or paused, and reads of chosen files can be made to fail.

use crate::buffer::SharedBuffer;
use crate::config::{ConfigError, ReaderConfig};
use crate::interop::FileReaderInterop;
use crate::protocol::{
    callbacks, functions, ElementRef, FileInfo, FileRef, ReadFileCallbackParams,
    ReadFileErrorParams, ReadFileMarshalledCallbackParams, ReadFileParams,
};
use crate::runtime::{CallbackDispatcher, ScriptRuntime};
use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// A file as the script side sees it
#[derive(Debug)]
pub struct MemoryFile {
    /// Identity used to skip files dropped twice onto an additive zone
    id: u64,
    name: String,
    mime_type: String,
    last_modified: i64,
    contents: Vec<u8>,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, contents: Vec<u8>) -> Arc<Self> {
        Self::build(name.into(), mime_type.into(), Utc::now().timestamp_millis(), contents)
    }

    pub fn with_last_modified(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        last_modified: i64,
        contents: Vec<u8>,
    ) -> Arc<Self> {
        Self::build(name.into(), mime_type.into(), last_modified, contents)
    }

    fn build(name: String, mime_type: String, last_modified: i64, contents: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            mime_type,
            last_modified,
            contents,
        })
    }

    /// Load a local file, taking its name and modification time from disk
    pub async fn from_path(path: &Path) -> anyhow::Result<Arc<Self>> {
        let contents = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let metadata = tokio::fs::metadata(path).await?;
        let last_modified = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mime_type = guess_mime_type(&name).to_string();
        Ok(Self::build(name, mime_type, last_modified, contents))
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            size: self.contents.len() as u64,
            mime_type: self.mime_type.clone(),
            last_modified: self.last_modified,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Bytes in `[position, position + count)`, clamped to the file
    pub fn slice(&self, position: u64, count: u32) -> &[u8] {
        let len = self.contents.len() as u64;
        let start = position.min(len);
        let end = position.saturating_add(u64::from(count)).min(len);
        &self.contents[start as usize..end as usize]
    }
}

fn guess_mime_type(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("md") | Some("rs") => "text/plain",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "",
    }
}

/// Configuration for the in-memory script side
#[derive(Debug, Clone)]
pub struct MemoryHostConfig {
    /// Whether unmarshalled (shared-buffer) calls are available
    pub shared_buffer: bool,
    /// Delay before each read callback is delivered
    pub callback_delay: Duration,
}

impl MemoryHostConfig {
    /// A runtime that can only do ordinary marshalled calls
    pub fn encoded_only() -> Self {
        Self {
            shared_buffer: false,
            ..Self::default()
        }
    }

    pub fn with_callback_delay(mut self, delay: Duration) -> Self {
        self.callback_delay = delay;
        self
    }
}

impl Default for MemoryHostConfig {
    fn default() -> Self {
        Self {
            shared_buffer: true,
            callback_delay: Duration::ZERO,
        }
    }
}

/// Counters for what the script side has been asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMetrics {
    /// Ordinary marshalled calls
    pub invocations: usize,
    /// Unmarshalled (shared-buffer) calls
    pub unmarshalled_invocations: usize,
    /// Read requests accepted, of either kind
    pub reads_started: usize,
    /// Callbacks that completed a pending read
    pub callbacks_delivered: usize,
    /// Callbacks the reader ignored because nothing was waiting for them
    pub stale_callbacks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Input,
    DropZone,
}

#[derive(Debug)]
struct ElementState {
    kind: ElementKind,
    files: Option<Vec<Arc<MemoryFile>>>,
    /// Set while drop events are registered; the flag is "additive"
    drop_handler: Option<bool>,
}

/// A callback waiting to be raised, with the buffer write that precedes it
enum PendingCallback {
    Read {
        params: ReadFileCallbackParams,
        write: Option<(SharedBuffer, usize, Vec<u8>)>,
    },
    Marshalled(ReadFileMarshalledCallbackParams),
    Error(ReadFileErrorParams),
}

#[derive(Default)]
struct HostState {
    elements: HashMap<ElementRef, ElementState>,
    next_element: u64,
    next_file_ref: u64,
    open_files: HashMap<FileRef, Arc<MemoryFile>>,
    failing: HashMap<String, String>,
    paused: bool,
    parked: Vec<PendingCallback>,
    metrics: HostMetrics,
}

struct HostInner {
    config: MemoryHostConfig,
    state: Mutex<HostState>,
    dispatcher: Mutex<Option<CallbackDispatcher>>,
}

/// In-memory implementation of the script side
#[derive(Clone)]
pub struct MemoryScriptHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for MemoryScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryScriptHost")
            .field("config", &self.inner.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl Default for MemoryScriptHost {
    fn default() -> Self {
        Self::new(MemoryHostConfig::default())
    }
}

impl MemoryScriptHost {
    pub fn new(config: MemoryHostConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                state: Mutex::new(HostState::default()),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route read callbacks to `dispatcher`
    pub fn connect(&self, dispatcher: CallbackDispatcher) {
        *self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);
    }

    /// Build a reader on top of this host and connect its callbacks
    pub fn reader(&self, config: ReaderConfig) -> Result<FileReaderInterop, ConfigError> {
        let interop = FileReaderInterop::with_config(Arc::new(self.clone()), config)?;
        self.connect(interop.callbacks());
        Ok(interop)
    }

    pub fn metrics(&self) -> HostMetrics {
        self.state().metrics.clone()
    }

    fn add_element(&self, kind: ElementKind, files: Option<Vec<Arc<MemoryFile>>>) -> ElementRef {
        let mut state = self.state();
        let element = ElementRef(state.next_element);
        state.next_element += 1;
        state.elements.insert(
            element,
            ElementState {
                kind,
                files,
                drop_handler: None,
            },
        );
        element
    }

    /// A file input with `files` selected
    pub fn add_input(&self, files: Vec<Arc<MemoryFile>>) -> ElementRef {
        self.add_element(ElementKind::Input, Some(files))
    }

    /// An element that only gets files by having them dropped on it
    pub fn add_drop_zone(&self) -> ElementRef {
        self.add_element(ElementKind::DropZone, None)
    }

    /// Replace the selection of a file input
    pub fn select_files(&self, element: ElementRef, files: Vec<Arc<MemoryFile>>) -> bool {
        match self.state().elements.get_mut(&element) {
            Some(el) if el.kind == ElementKind::Input => {
                el.files = Some(files);
                true
            }
            _ => false,
        }
    }

    /// Drop `files` onto `element`; ignored unless drop events are registered
    pub fn drop_files(&self, element: ElementRef, files: Vec<Arc<MemoryFile>>) -> bool {
        let mut state = self.state();
        let Some(el) = state.elements.get_mut(&element) else {
            return false;
        };
        let Some(additive) = el.drop_handler else {
            return false;
        };

        let list = match (additive, el.files.take()) {
            (true, Some(mut existing)) if !existing.is_empty() => {
                for file in files {
                    if !existing.iter().any(|f| f.id == file.id) {
                        existing.push(file);
                    }
                }
                existing
            }
            _ => files,
        };
        el.files = Some(list);
        true
    }

    /// Make every read of a file named `name` fail with `message`
    pub fn fail_reads_of(&self, name: impl Into<String>, message: impl Into<String>) {
        self.state().failing.insert(name.into(), message.into());
    }

    /// Hold read callbacks instead of delivering them
    pub fn pause_callbacks(&self) {
        self.state().paused = true;
    }

    /// Deliver held callbacks and stop holding new ones
    pub fn resume_callbacks(&self) {
        let parked = {
            let mut state = self.state();
            state.paused = false;
            std::mem::take(&mut state.parked)
        };
        for callback in parked {
            self.deliver(callback);
        }
    }

    /// Number of callbacks currently held by `pause_callbacks`
    pub fn parked_callbacks(&self) -> usize {
        self.state().parked.len()
    }

    /// Number of references opened and not yet disposed
    pub fn open_file_count(&self) -> usize {
        self.state().open_files.len()
    }

    fn files_of(state: &HostState, element: ElementRef) -> Option<&Vec<Arc<MemoryFile>>> {
        state.elements.get(&element).and_then(|el| el.files.as_ref())
    }

    fn get_file_count(&self, element: ElementRef) -> i64 {
        let state = self.state();
        Self::files_of(&state, element).map_or(-1, |files| files.len() as i64)
    }

    fn get_file_info_from_element(&self, element: ElementRef, index: usize) -> Value {
        let state = self.state();
        Self::files_of(&state, element)
            .and_then(|files| files.get(index))
            .map_or(Value::Null, |file| json!(file.info()))
    }

    fn get_file_info_from_reference(&self, file_ref: FileRef) -> Value {
        self.state()
            .open_files
            .get(&file_ref)
            .map_or(Value::Null, |file| json!(file.info()))
    }

    fn open_read(&self, element: ElementRef, index: usize) -> anyhow::Result<FileRef> {
        let mut state = self.state();
        let file = {
            let files = Self::files_of(&state, element).ok_or_else(|| anyhow!("No FileList available."))?;
            files
                .get(index)
                .cloned()
                .ok_or_else(|| anyhow!("No file with index {} available.", index))?
        };
        let file_ref = FileRef(state.next_file_ref);
        state.next_file_ref += 1;
        state.open_files.insert(file_ref, file);
        Ok(file_ref)
    }

    fn register_drop_events(&self, element: ElementRef, additive: bool) -> anyhow::Result<bool> {
        let mut state = self.state();
        let el = state
            .elements
            .get_mut(&element)
            .ok_or_else(|| anyhow!("unknown element {:?}", element))?;
        el.drop_handler = Some(additive);
        Ok(true)
    }

    fn unregister_drop_events(&self, element: ElementRef) -> bool {
        if let Some(el) = self.state().elements.get_mut(&element) {
            el.drop_handler = None;
            if el.kind == ElementKind::DropZone {
                el.files = None;
            }
        }
        true
    }

    fn clear_value(&self, element: ElementRef) {
        if let Some(el) = self.state().elements.get_mut(&element) {
            el.files = match el.kind {
                ElementKind::Input => Some(Vec::new()),
                ElementKind::DropZone => None,
            };
        }
    }

    /// Look up the bytes a read asks for, or the error it should fail with
    fn read_slice(&self, params: &ReadFileParams) -> Result<Vec<u8>, String> {
        let mut state = self.state();
        state.metrics.reads_started += 1;
        let file = state
            .open_files
            .get(&params.file_ref)
            .cloned()
            .ok_or_else(|| format!("file reference {} is not open", params.file_ref))?;
        if let Some(message) = state.failing.get(file.name()) {
            return Err(message.clone());
        }
        Ok(file.slice(params.position, params.count).to_vec())
    }

    fn schedule(&self, callback: PendingCallback) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("read callbacks need a tokio runtime")?;
        let host = self.clone();
        let delay = self.inner.config.callback_delay;
        runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            host.deliver_or_park(callback);
        });
        Ok(())
    }

    fn deliver_or_park(&self, callback: PendingCallback) {
        {
            let mut state = self.state();
            if state.paused {
                state.parked.push(callback);
                return;
            }
        }
        self.deliver(callback);
    }

    fn deliver(&self, callback: PendingCallback) {
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(dispatcher) = dispatcher else {
            tracing::warn!("memory host has no reader connected; dropping read callback");
            self.state().metrics.stale_callbacks += 1;
            return;
        };

        let (name, args) = match callback {
            PendingCallback::Read { params, write } => {
                if let Some((buffer, offset, bytes)) = write {
                    if let Err(e) = buffer.write_at(offset, &bytes) {
                        let error = ReadFileErrorParams {
                            call_back_id: params.call_back_id,
                            exception: e.to_string(),
                        };
                        self.deliver(PendingCallback::Error(error));
                        return;
                    }
                }
                (callbacks::READ_FILE, serde_json::to_string(&params))
            }
            PendingCallback::Marshalled(params) => {
                (callbacks::READ_FILE_MARSHALLED, serde_json::to_string(&params))
            }
            PendingCallback::Error(params) => (callbacks::READ_FILE_ERROR, serde_json::to_string(&params)),
        };
        let matched = match args {
            Ok(args) => dispatcher.dispatch(name, &args),
            Err(e) => {
                tracing::error!("failed to serialize {} arguments: {}", name, e);
                false
            }
        };

        let mut state = self.state();
        if matched {
            state.metrics.callbacks_delivered += 1;
        } else {
            state.metrics.stale_callbacks += 1;
        }
    }

    fn start_marshalled_read(&self, params: ReadFileParams) -> anyhow::Result<Value> {
        let callback = match self.read_slice(&params) {
            Ok(bytes) => PendingCallback::Marshalled(ReadFileMarshalledCallbackParams {
                call_back_id: params.call_back_id,
                data: (!bytes.is_empty()).then(|| B64.encode(&bytes)),
            }),
            Err(exception) => PendingCallback::Error(ReadFileErrorParams {
                call_back_id: params.call_back_id,
                exception,
            }),
        };
        self.schedule(callback)?;
        Ok(Value::Bool(true))
    }

    fn start_unmarshalled_read(&self, buffer: SharedBuffer, params: ReadFileParams) -> anyhow::Result<bool> {
        let callback = match self.read_slice(&params) {
            Ok(bytes) => PendingCallback::Read {
                params: ReadFileCallbackParams {
                    call_back_id: params.call_back_id,
                    bytes_read: bytes.len() as u64,
                },
                write: Some((buffer, params.buffer_offset, bytes)),
            },
            Err(exception) => PendingCallback::Error(ReadFileErrorParams {
                call_back_id: params.call_back_id,
                exception,
            }),
        };
        self.schedule(callback)?;
        Ok(true)
    }
}

fn arg<T: DeserializeOwned>(function: &str, args: &[Value], index: usize) -> anyhow::Result<T> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| anyhow!("{} expects argument {}", function, index))?;
    serde_json::from_value(value).with_context(|| format!("{} argument {}", function, index))
}

#[async_trait]
impl ScriptRuntime for MemoryScriptHost {
    async fn invoke(&self, function: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        self.state().metrics.invocations += 1;
        match function {
            functions::GET_FILE_COUNT => Ok(json!(self.get_file_count(arg(function, &args, 0)?))),
            functions::GET_FILE_INFO_FROM_ELEMENT => Ok(self.get_file_info_from_element(
                arg(function, &args, 0)?,
                arg(function, &args, 1)?,
            )),
            functions::GET_FILE_INFO_FROM_REFERENCE => {
                Ok(self.get_file_info_from_reference(arg(function, &args, 0)?))
            }
            functions::OPEN_READ => {
                let file_ref = self.open_read(arg(function, &args, 0)?, arg(function, &args, 1)?)?;
                Ok(json!(file_ref))
            }
            functions::DISPOSE => {
                let file_ref: FileRef = arg(function, &args, 0)?;
                Ok(json!(self.state().open_files.remove(&file_ref).is_some()))
            }
            functions::READ_FILE_MARSHALLED => self.start_marshalled_read(arg(function, &args, 0)?),
            functions::REGISTER_DROP_EVENTS => Ok(json!(self.register_drop_events(
                arg(function, &args, 0)?,
                arg(function, &args, 1)?
            )?)),
            functions::UNREGISTER_DROP_EVENTS => {
                Ok(json!(self.unregister_drop_events(arg(function, &args, 0)?)))
            }
            functions::CLEAR_VALUE => {
                self.clear_value(arg(function, &args, 0)?);
                Ok(json!(0))
            }
            other => bail!("unknown script function '{}'", other),
        }
    }

    fn supports_unmarshalled(&self) -> bool {
        self.inner.config.shared_buffer
    }

    fn invoke_unmarshalled(
        &self,
        function: &str,
        buffer: SharedBuffer,
        args_json: &str,
    ) -> anyhow::Result<bool> {
        if !self.inner.config.shared_buffer {
            bail!("unmarshalled calls are disabled");
        }
        self.state().metrics.unmarshalled_invocations += 1;
        match function {
            functions::READ_FILE_UNMARSHALLED => {
                let params: ReadFileParams =
                    serde_json::from_str(args_json).context("read arguments")?;
                self.start_unmarshalled_read(buffer, params)
            }
            other => bail!("unknown unmarshalled function '{}'", other),
        }
    }
}
