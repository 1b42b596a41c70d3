//! Transport seam between the managed side and the script runtime
//!
//! `ScriptRuntime` is how calls go out; `CallbackDispatcher` is how read
//! completions come back in. Neither knows anything about files beyond the
//! records in `protocol`.

use crate::buffer::SharedBuffer;
use crate::error::FileReaderError;
use crate::protocol::{
    callbacks, ReadFileCallbackParams, ReadFileErrorParams, ReadFileMarshalledCallbackParams,
};
use crate::registry::CorrelationRegistry;
use crate::transfer::ReadResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Invokes named functions in the script environment
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Call `function` with JSON arguments and wait for its JSON result
    async fn invoke(&self, function: &str, args: Vec<Value>) -> anyhow::Result<Value>;

    /// Whether `invoke_unmarshalled` can hand a byte buffer to the script side
    ///
    /// Asked once per reader; the answer must not change afterwards.
    fn supports_unmarshalled(&self) -> bool {
        false
    }

    /// Call `function` with a caller-owned buffer and a JSON argument string
    ///
    /// Returns as soon as the call has been started. The script side keeps
    /// the buffer and writes into it before raising its completion callback.
    fn invoke_unmarshalled(
        &self,
        function: &str,
        buffer: SharedBuffer,
        args_json: &str,
    ) -> anyhow::Result<bool> {
        let _ = (buffer, args_json);
        anyhow::bail!("runtime cannot pass buffers to '{}'", function)
    }
}

/// Entry point for read callbacks raised by the script side
///
/// Every method returns whether the callback matched a pending read. `false`
/// means the read was already completed, cancelled, or never existed.
#[derive(Clone, Debug)]
pub struct CallbackDispatcher {
    pending: CorrelationRegistry<ReadResult>,
}

impl CallbackDispatcher {
    pub(crate) fn new(pending: CorrelationRegistry<ReadResult>) -> Self {
        Self { pending }
    }

    /// A shared-buffer read finished; its bytes are already in the buffer
    pub fn read_file_callback(&self, params: ReadFileCallbackParams) -> bool {
        tracing::trace!(
            "read callback {}: {} bytes",
            params.call_back_id,
            params.bytes_read
        );
        self.pending.resolve(
            &params.call_back_id,
            ReadResult::BytesWritten(params.bytes_read),
        )
    }

    /// A marshalled read finished with an encoded payload
    pub fn read_file_marshalled_callback(&self, params: ReadFileMarshalledCallbackParams) -> bool {
        tracing::trace!("marshalled read callback {}", params.call_back_id);
        self.pending
            .resolve(&params.call_back_id, ReadResult::EncodedPayload(params.data))
    }

    /// Either kind of read failed on the script side
    pub fn read_file_error(&self, params: ReadFileErrorParams) -> bool {
        tracing::debug!(
            "read error callback {}: {}",
            params.call_back_id,
            params.exception
        );
        self.pending.fail(
            &params.call_back_id,
            FileReaderError::TransferFailure(params.exception),
        )
    }

    /// Route a callback by name with its JSON argument record
    pub fn dispatch(&self, name: &str, args_json: &str) -> bool {
        match name {
            callbacks::READ_FILE => {
                parse_args(name, args_json).is_some_and(|p| self.read_file_callback(p))
            }
            callbacks::READ_FILE_MARSHALLED => parse_args(name, args_json)
                .is_some_and(|p| self.read_file_marshalled_callback(p)),
            callbacks::READ_FILE_ERROR => {
                parse_args(name, args_json).is_some_and(|p| self.read_file_error(p))
            }
            _ => {
                tracing::warn!("unknown callback '{}'", name);
                false
            }
        }
    }
}

fn parse_args<T: DeserializeOwned>(name: &str, args_json: &str) -> Option<T> {
    match serde_json::from_str(args_json) {
        Ok(params) => Some(params),
        Err(e) => {
            tracing::warn!("malformed arguments for callback '{}': {}", name, e);
            None
        }
    }
}
