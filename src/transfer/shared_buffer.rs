//! Shared-buffer ("unmarshalled") transfer
//!
//! The destination buffer itself goes out with the request. The script side
//! writes the slice into it and then raises `readFileCallback` with the byte
//! count, so nothing is encoded or copied on the way back.

use super::{ReadRequest, ReadResult, TransferMode, TransferStrategy};
use crate::buffer::SharedBuffer;
use crate::error::{FileReaderError, Result};
use crate::protocol::{functions, ReadFileParams};
use crate::registry::{CallbackIdGenerator, CorrelationRegistry};
use crate::runtime::ScriptRuntime;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct SharedBufferTransfer {
    runtime: Arc<dyn ScriptRuntime>,
    pending: CorrelationRegistry<ReadResult>,
    ids: Arc<CallbackIdGenerator>,
}

impl SharedBufferTransfer {
    pub fn new(
        runtime: Arc<dyn ScriptRuntime>,
        pending: CorrelationRegistry<ReadResult>,
        ids: Arc<CallbackIdGenerator>,
    ) -> Self {
        Self {
            runtime,
            pending,
            ids,
        }
    }
}

#[async_trait]
impl TransferStrategy for SharedBufferTransfer {
    fn mode(&self) -> TransferMode {
        TransferMode::SharedBuffer
    }

    async fn read(
        &self,
        request: ReadRequest,
        buffer: &SharedBuffer,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let id = self.ids.next_sequence();
        let call = self.pending.register(id.clone())?;

        let params = ReadFileParams {
            file_ref: request.file_ref,
            position: request.position,
            count: request.count,
            call_back_id: id,
            buffer_offset: request.buffer_offset,
        };
        let args = serde_json::to_string(&params).map_err(FileReaderError::host)?;
        tracing::debug!(
            "shared-buffer read {}: file {} at {} for {} bytes",
            params.call_back_id,
            params.file_ref,
            params.position,
            params.count
        );

        let started = self
            .runtime
            .invoke_unmarshalled(functions::READ_FILE_UNMARSHALLED, buffer.clone(), &args)
            .map_err(FileReaderError::host)?;
        if !started {
            return Err(FileReaderError::Host(format!(
                "script side did not start read {}",
                params.call_back_id
            )));
        }

        match call.wait(cancel).await? {
            ReadResult::BytesWritten(n) if n <= u64::from(request.count) => Ok(n as usize),
            ReadResult::BytesWritten(n) => Err(FileReaderError::TransferFailure(format!(
                "script side reported {} bytes for a {}-byte read",
                n, request.count
            ))),
            ReadResult::EncodedPayload(_) => Err(FileReaderError::TransferFailure(
                "encoded payload delivered for a shared-buffer read".to_string(),
            )),
        }
    }
}
