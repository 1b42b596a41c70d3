//! Wire shapes exchanged with the script side
//!
//! Everything here is plain data: identifiers, the file metadata record, and
//! the argument/callback records of the read protocol. JSON field names are
//! camelCase to match what the script component produces and expects.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Script function names invoked by the managed side
pub mod functions {
    pub const OPEN_READ: &str = "fileReader.openRead";
    pub const GET_FILE_COUNT: &str = "fileReader.getFileCount";
    pub const GET_FILE_INFO_FROM_ELEMENT: &str = "fileReader.getFileInfoFromElement";
    pub const GET_FILE_INFO_FROM_REFERENCE: &str = "fileReader.getFileInfoFromReference";
    pub const DISPOSE: &str = "fileReader.dispose";
    pub const READ_FILE_UNMARSHALLED: &str = "fileReader.readFileUnmarshalled";
    pub const READ_FILE_MARSHALLED: &str = "fileReader.readFileMarshalled";
    pub const REGISTER_DROP_EVENTS: &str = "fileReader.registerDropEvents";
    pub const UNREGISTER_DROP_EVENTS: &str = "fileReader.unregisterDropEvents";
    pub const CLEAR_VALUE: &str = "fileReader.clearValue";
}

/// Callback names the script side raises to complete a read
pub mod callbacks {
    pub const READ_FILE: &str = "readFileCallback";
    pub const READ_FILE_MARSHALLED: &str = "readFileMarshalledCallback";
    pub const READ_FILE_ERROR: &str = "readFileError";
}

/// Handle to a file the script side has opened for reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(pub u64);

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a UI element (file input or drop target)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementRef(pub u64);

/// Correlation id linking an outbound read to its inbound callback
///
/// Shared-buffer reads use a process-local counter, marshalled reads use a
/// random token. The two spaces cannot collide: a counter renders as at most
/// 20 decimal digits, a token as exactly 32 hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallbackId {
    Sequence(u64),
    Token(Uuid),
}

impl CallbackId {
    pub fn token() -> Self {
        CallbackId::Token(Uuid::new_v4())
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackId::Sequence(n) => write!(f, "{n}"),
            CallbackId::Token(uuid) => write!(f, "{}", uuid.simple()),
        }
    }
}

impl FromStr for CallbackId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Uuid::try_parse(s)
                .map(CallbackId::Token)
                .map_err(|e| format!("invalid callback token '{s}': {e}"));
        }
        s.parse::<u64>()
            .map(CallbackId::Sequence)
            .map_err(|_| format!("invalid callback id '{s}'"))
    }
}

impl Serialize for CallbackId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CallbackId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Script callers may echo a numeric id back as a JSON number
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(CallbackId::Sequence(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Metadata snapshot of a script-side file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// MIME type as reported by the script side, empty when unknown
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Milliseconds since the Unix epoch
    pub last_modified: i64,
}

impl FileInfo {
    /// Last modification time, if the millisecond value is representable
    pub fn last_modified_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.last_modified).single()
    }
}

/// Arguments of a read request, shared by both transfer modes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileParams {
    pub file_ref: FileRef,
    pub position: u64,
    pub count: u32,
    pub call_back_id: CallbackId,
    /// Where in the shared buffer the script side starts writing
    #[serde(default)]
    pub buffer_offset: usize,
}

/// Completion of a shared-buffer read: the bytes are already in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileCallbackParams {
    pub call_back_id: CallbackId,
    pub bytes_read: u64,
}

/// Completion of a marshalled read: base64 payload, absent for empty reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileMarshalledCallbackParams {
    pub call_back_id: CallbackId,
    #[serde(default)]
    pub data: Option<String>,
}

/// Failure of either kind of read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileErrorParams {
    pub call_back_id: CallbackId,
    pub exception: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_id_spaces_do_not_overlap() {
        let seq = CallbackId::Sequence(u64::MAX);
        let token = CallbackId::token();

        assert!(seq.to_string().len() <= 20);
        assert_eq!(token.to_string().len(), 32);
        assert_eq!(seq.to_string().parse::<CallbackId>().unwrap(), seq);
        assert_eq!(token.to_string().parse::<CallbackId>().unwrap(), token);
    }

    #[test]
    fn test_callback_id_accepts_json_number() {
        let params: ReadFileCallbackParams =
            serde_json::from_str(r#"{"callBackId": 7, "bytesRead": 12}"#).unwrap();
        assert_eq!(params.call_back_id, CallbackId::Sequence(7));
        assert_eq!(params.bytes_read, 12);

        let params: ReadFileCallbackParams =
            serde_json::from_str(r#"{"callBackId": "8", "bytesRead": 0}"#).unwrap();
        assert_eq!(params.call_back_id, CallbackId::Sequence(8));
    }

    #[test]
    fn test_callback_id_rejects_garbage() {
        assert!("not-an-id".parse::<CallbackId>().is_err());
        assert!("".parse::<CallbackId>().is_err());
    }

    #[test]
    fn test_file_info_json_shape() {
        let json = r#"{"name":"photo.png","size":2048,"type":"image/png","lastModified":1700000000000}"#;
        let info: FileInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.name, "photo.png");
        assert_eq!(info.size, 2048);
        assert_eq!(info.mime_type, "image/png");

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["type"], "image/png");
        assert_eq!(value["lastModified"], 1_700_000_000_000i64);

        let modified = info.last_modified_utc().unwrap();
        assert_eq!(modified.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_marshalled_callback_missing_data() {
        let params: ReadFileMarshalledCallbackParams =
            serde_json::from_str(r#"{"callBackId":"0123456789abcdef0123456789abcdef","data":null}"#)
                .unwrap();
        assert!(params.data.is_none());
        assert!(matches!(params.call_back_id, CallbackId::Token(_)));
    }
}
