#![allow(dead_code)]

pub mod tracing;

use file_reader::host::{MemoryFile, MemoryHostConfig, MemoryScriptHost};
use file_reader::{ElementRef, FileReaderInterop, ReaderConfig, TransferMode, TransferPreference};
use std::sync::Arc;

/// Both transfer modes, forced through the reader configuration
pub const MODES: [TransferPreference; 2] = [TransferPreference::SharedBuffer, TransferPreference::Encoded];

/// A memory host with one file input and a reader connected to it
pub struct Harness {
    pub host: MemoryScriptHost,
    pub reader: FileReaderInterop,
    pub input: ElementRef,
}

impl Harness {
    pub fn new(mode: TransferPreference, files: Vec<Arc<MemoryFile>>) -> Self {
        Self::with_host(MemoryHostConfig::default(), reader_config(mode), files)
    }

    pub fn with_host(
        host_config: MemoryHostConfig,
        config: ReaderConfig,
        files: Vec<Arc<MemoryFile>>,
    ) -> Self {
        self::tracing::init_tracing_from_env();
        let host = MemoryScriptHost::new(host_config);
        let input = host.add_input(files);
        let reader = host.reader(config).unwrap();
        Self {
            host,
            reader,
            input,
        }
    }

    /// Harness over a single text file
    pub fn single(mode: TransferPreference, contents: &[u8]) -> Self {
        Self::new(mode, vec![text_file("data.txt", contents)])
    }
}

pub fn reader_config(mode: TransferPreference) -> ReaderConfig {
    ReaderConfig {
        transfer_mode: mode,
        ..ReaderConfig::default()
    }
}

pub fn text_file(name: &str, contents: &[u8]) -> Arc<MemoryFile> {
    MemoryFile::with_last_modified(name, "text/plain", 1_700_000_000_000, contents.to_vec())
}

pub fn expected_mode(mode: TransferPreference) -> TransferMode {
    match mode {
        TransferPreference::Encoded => TransferMode::Encoded,
        _ => TransferMode::SharedBuffer,
    }
}
