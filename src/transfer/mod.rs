// Transfer strategies for moving file bytes across the script boundary
//
// Two ways exist to get a chunk of a script-side file into managed memory:
// - shared buffer: the script side writes into a buffer we hand it, and the
//   completion callback only carries a byte count
// - encoded: the bytes travel base64-encoded inside the completion callback
//   and are decoded and copied here
//
// Which one is used is decided once, by probing the runtime, and then held
// for the lifetime of the reader.

pub mod encoded;
pub mod shared_buffer;

pub use encoded::EncodedTransfer;
pub use shared_buffer::SharedBufferTransfer;

use crate::buffer::SharedBuffer;
use crate::config::TransferPreference;
use crate::error::Result;
use crate::protocol::FileRef;
use crate::registry::{CallbackIdGenerator, CorrelationRegistry};
use crate::runtime::ScriptRuntime;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Active transfer mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Script side writes straight into the caller's buffer ("unmarshalled")
    SharedBuffer,
    /// Bytes travel base64-encoded inside the response ("marshalled")
    Encoded,
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMode::SharedBuffer => write!(f, "shared-buffer"),
            TransferMode::Encoded => write!(f, "encoded"),
        }
    }
}

/// What a read completion carries, depending on the transfer mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Shared-buffer mode: the payload is already in the caller's buffer
    BytesWritten(u64),
    /// Encoded mode: base64 payload, `None` or blank for an empty read
    EncodedPayload(Option<String>),
}

/// One chunk request against an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub file_ref: FileRef,
    pub position: u64,
    pub count: u32,
    /// Offset in the destination buffer where the bytes go
    pub buffer_offset: usize,
}

/// A way of carrying one read across the boundary
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn mode(&self) -> TransferMode;

    /// Issue `request` and wait for its completion
    ///
    /// Writes the bytes to `buffer[request.buffer_offset..]` and returns how
    /// many were read. Zero means the position is at or past end-of-file.
    async fn read(
        &self,
        request: ReadRequest,
        buffer: &SharedBuffer,
        cancel: &CancellationToken,
    ) -> Result<usize>;
}

/// Decides once which transfer mode a reader uses
#[derive(Debug)]
pub struct TransferModeSelector {
    preference: TransferPreference,
    mode: OnceLock<TransferMode>,
}

impl TransferModeSelector {
    pub fn new(preference: TransferPreference) -> Self {
        Self {
            preference,
            mode: OnceLock::new(),
        }
    }

    /// The mode for this selector, probing `runtime` on first use
    ///
    /// Later calls return the cached answer even if given another runtime.
    pub fn select(&self, runtime: &dyn ScriptRuntime) -> TransferMode {
        *self.mode.get_or_init(|| {
            let supported = runtime.supports_unmarshalled();
            let mode = match self.preference {
                TransferPreference::Auto if supported => TransferMode::SharedBuffer,
                TransferPreference::Auto => TransferMode::Encoded,
                TransferPreference::SharedBuffer if supported => TransferMode::SharedBuffer,
                TransferPreference::SharedBuffer => {
                    tracing::warn!(
                        "shared-buffer transfer requested but the script runtime cannot pass buffers; using encoded transfer"
                    );
                    TransferMode::Encoded
                }
                TransferPreference::Encoded => TransferMode::Encoded,
            };
            tracing::info!("file reads will use {} transfer", mode);
            mode
        })
    }

    /// The cached mode, if a selection has happened
    pub fn selected(&self) -> Option<TransferMode> {
        self.mode.get().copied()
    }
}

/// Build the strategy for `mode`
pub(crate) fn build_strategy(
    mode: TransferMode,
    runtime: Arc<dyn ScriptRuntime>,
    pending: CorrelationRegistry<ReadResult>,
    ids: Arc<CallbackIdGenerator>,
) -> Arc<dyn TransferStrategy> {
    match mode {
        TransferMode::SharedBuffer => Arc::new(SharedBufferTransfer::new(runtime, pending, ids)),
        TransferMode::Encoded => Arc::new(EncodedTransfer::new(runtime, pending, ids)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CapabilityRuntime {
        unmarshalled: bool,
        capability_checks: AtomicUsize,
    }

    #[async_trait]
    impl ScriptRuntime for CapabilityRuntime {
        async fn invoke(&self, _function: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }

        fn supports_unmarshalled(&self) -> bool {
            self.capability_checks.fetch_add(1, Ordering::SeqCst);
            self.unmarshalled
        }
    }

    fn runtime(unmarshalled: bool) -> CapabilityRuntime {
        CapabilityRuntime {
            unmarshalled,
            capability_checks: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_auto_follows_capability() {
        let capable = runtime(true);
        assert_eq!(
            TransferModeSelector::new(TransferPreference::Auto).select(&capable),
            TransferMode::SharedBuffer
        );

        let plain = runtime(false);
        assert_eq!(
            TransferModeSelector::new(TransferPreference::Auto).select(&plain),
            TransferMode::Encoded
        );
    }

    #[test]
    fn test_capability_checked_once() {
        let capable = runtime(true);
        let selector = TransferModeSelector::new(TransferPreference::Auto);
        assert_eq!(selector.selected(), None);

        selector.select(&capable);
        selector.select(&capable);
        // A different answer later does not change the cached mode
        assert_eq!(selector.select(&runtime(false)), TransferMode::SharedBuffer);
        assert_eq!(capable.capability_checks.load(Ordering::SeqCst), 1);
        assert_eq!(selector.selected(), Some(TransferMode::SharedBuffer));
    }

    #[test]
    fn test_forced_preferences() {
        let capable = runtime(true);
        assert_eq!(
            TransferModeSelector::new(TransferPreference::Encoded).select(&capable),
            TransferMode::Encoded
        );

        let plain = runtime(false);
        assert_eq!(
            TransferModeSelector::new(TransferPreference::SharedBuffer).select(&plain),
            TransferMode::Encoded
        );
    }
}
