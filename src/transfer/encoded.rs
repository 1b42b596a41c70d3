//! Encoded ("marshalled") transfer
//!
//! Only scalar arguments go out. The completion callback carries the bytes as
//! base64 text, which is decoded here and copied into the caller's buffer.
//! Works with any runtime, at the cost of a third more bytes on the wire and
//! an extra decode per chunk.

use super::{ReadRequest, ReadResult, TransferMode, TransferStrategy};
use crate::buffer::SharedBuffer;
use crate::error::{FileReaderError, Result};
use crate::protocol::{functions, ReadFileParams};
use crate::registry::{CallbackIdGenerator, CorrelationRegistry};
use crate::runtime::ScriptRuntime;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct EncodedTransfer {
    runtime: Arc<dyn ScriptRuntime>,
    pending: CorrelationRegistry<ReadResult>,
    ids: Arc<CallbackIdGenerator>,
}

impl EncodedTransfer {
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

/// Decode a marshalled payload; a missing or blank payload is zero bytes
pub fn decode_payload(data: Option<&str>) -> Result<Vec<u8>> {
    match data.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(text) => B64
            .decode(text)
            .map_err(|e| FileReaderError::Decode(format!("invalid base64 payload: {e}"))),
    }
}

#[async_trait]
impl TransferStrategy for EncodedTransfer {
    fn mode(&self) -> TransferMode {
        TransferMode::Encoded
    }

    async fn read(
        &self,
        request: ReadRequest,
        buffer: &SharedBuffer,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let id = self.ids.next_token();
        let call = self.pending.register(id.clone())?;

        let params = ReadFileParams {
            file_ref: request.file_ref,
            position: request.position,
            count: request.count,
            call_back_id: id,
            buffer_offset: 0,
        };
        let args = serde_json::to_value(&params).map_err(FileReaderError::host)?;
        tracing::debug!(
            "encoded read {}: file {} at {} for {} bytes",
            params.call_back_id,
            params.file_ref,
            params.position,
            params.count
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FileReaderError::Cancelled),
            started = self.runtime.invoke(functions::READ_FILE_MARSHALLED, vec![args]) => {
                started.map_err(FileReaderError::host)?;
            }
        }

        let data = match call.wait(cancel).await? {
            ReadResult::EncodedPayload(data) => data,
            ReadResult::BytesWritten(_) => {
                return Err(FileReaderError::TransferFailure(
                    "byte count delivered for an encoded read".to_string(),
                ))
            }
        };

        let bytes = decode_payload(data.as_deref())?;
        if bytes.len() > request.count as usize {
            return Err(FileReaderError::Decode(format!(
                "payload of {} bytes exceeds the {} bytes requested",
                bytes.len(),
                request.count
            )));
        }
        buffer.write_at(request.buffer_offset, &bytes)?;
        Ok(bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileRef;
    use crate::transfer::testing::ReplyRuntime;

    async fn read_with_reply(
        reply: ReadResult,
        buffer: &SharedBuffer,
    ) -> (Result<usize>, CorrelationRegistry<ReadResult>) {
        let pending = CorrelationRegistry::new();
        let runtime = Arc::new(ReplyRuntime::new(&pending, reply));
        let transfer =
            EncodedTransfer::new(runtime, pending.clone(), Arc::new(CallbackIdGenerator::new()));
        let request = ReadRequest {
            file_ref: FileRef(1),
            position: 0,
            count: 4,
            buffer_offset: 2,
        };
        let result = transfer
            .read(request, buffer, &CancellationToken::new())
            .await;
        (result, pending)
    }

    #[tokio::test]
    async fn test_payload_copied_at_offset() {
        let buffer = SharedBuffer::new(8);
        let (result, pending) =
            read_with_reply(ReadResult::EncodedPayload(Some("QUJD".to_string())), &buffer).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(buffer.to_vec(0, 8), b"\0\0ABC\0\0\0");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let buffer = SharedBuffer::new(8);
        // "ABCDEF": six bytes for a four-byte request
        let (result, pending) =
            read_with_reply(ReadResult::EncodedPayload(Some("QUJDREVG".to_string())), &buffer).await;
        match result {
            Err(FileReaderError::Decode(msg)) => {
                assert!(msg.contains("6 bytes exceeds the 4 bytes"), "{msg}")
            }
            other => panic!("expected Decode, got {other:?}"),
        }
        assert_eq!(buffer.to_vec(0, 8), vec![0u8; 8], "nothing is written");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_byte_count_completion_rejected() {
        let buffer = SharedBuffer::new(8);
        let (result, pending) = read_with_reply(ReadResult::BytesWritten(2), &buffer).await;
        match result {
            Err(FileReaderError::TransferFailure(msg)) => {
                assert!(msg.contains("byte count delivered"), "{msg}")
            }
            other => panic!("expected TransferFailure, got {other:?}"),
        }
        assert!(pending.is_empty());
    }


    #[test]
    fn test_decode_empty_payloads() {
        assert!(decode_payload(None).unwrap().is_empty());
        assert!(decode_payload(Some("")).unwrap().is_empty());
        assert!(decode_payload(Some("  \n")).unwrap().is_empty());
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(Some("QUJDRA==")).unwrap(), b"ABCD");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_payload(Some("!!not base64!!")).unwrap_err();
        assert!(matches!(err, FileReaderError::Decode(_)));
    }
}
