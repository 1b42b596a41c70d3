// File reader library - chunked reads of script-side files

pub mod buffer;
pub mod config;
pub mod error;
pub mod handle;
pub mod host;
pub mod interop;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod stream;
pub mod transfer;

#[cfg(feature = "cli")]
pub mod tracing_setup;

pub use buffer::SharedBuffer;
pub use config::{ConfigError, ReaderConfig, TransferPreference};
pub use error::{FileReaderError, Result};
pub use handle::FileHandle;
pub use host::{MemoryFile, MemoryHostConfig, MemoryScriptHost};
pub use interop::FileReaderInterop;
pub use protocol::{CallbackId, ElementRef, FileInfo, FileRef};
pub use registry::CorrelationRegistry;
pub use runtime::{CallbackDispatcher, ScriptRuntime};
pub use stream::SeekableFileStream;
pub use transfer::{TransferMode, TransferModeSelector};
