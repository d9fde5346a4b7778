//! Wire protocol types for the filesystem agent.
//!
//! Messages travel as length-prefixed MessagePack frames. Requests carry a
//! trusted caller identity (`username`) supplied by the transport; responses
//! and notifications share the connection's writer.

use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Deserialize a typed record out of a MessagePack value.
pub fn from_value<T>(value: Value) -> Result<T, rmpv::ext::Error>
where
    T: serde::de::DeserializeOwned,
{
    rmpv::ext::from_value(value)
}

/// Serialize into a MessagePack value, collapsing to Nil on failure.
pub fn to_value<T: Serialize>(value: &T) -> Value {
    rmpv::ext::to_value(value).unwrap_or(Value::Nil)
}

/// Build a `Value::Map` with string keys from mixed value types.
#[macro_export]
macro_rules! msgpack_map {
    ($($key:expr => $val:expr),* $(,)?) => {
        rmpv::Value::Map(vec![
            $((
                rmpv::Value::String($key.into()),
                $crate::protocol::IntoValue::into_value($val),
            )),*
        ])
    };
}

/// Conversion into a MessagePack value for `msgpack_map!` operands.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoValue for u64 {
    fn into_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoValue for usize {
    fn into_value(self) -> Value {
        Value::from(self as u64)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::from(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Nil,
        }
    }
}

/// Request envelope. `params` is an array; the first element is the
/// operation's parameter record.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub username: String,
    pub method: String,
    #[serde(default = "nil_value")]
    pub params: Value,
}

fn nil_value() -> Value {
    Value::Nil
}

/// Request ID can be a number or string
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

/// Response to a single request.
#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Server-initiated message with no request id.
#[derive(Debug, Serialize)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Invocation of a client-side callback handle.
    pub fn callback(id: u64, args: Vec<Value>) -> Self {
        Self::new(
            "Callback",
            msgpack_map! {
                "id" => id,
                "args" => Value::Array(args)
            },
        )
    }
}

/// Structured error object.
#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    // Protocol error codes
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Operation error codes
    pub const NOT_FOUND: i32 = -32001;
    pub const PERMISSION_DENIED: i32 = -32002;
    pub const IO_ERROR: i32 = -32003;
    pub const ALREADY_EXISTS: i32 = -32004;
    pub const IS_A_DIRECTORY: i32 = -32005;
    pub const NOT_A_DIRECTORY: i32 = -32006;
    pub const DIRECTORY_NOT_EMPTY: i32 = -32007;
    pub const CROSS_DEVICE: i32 = -32008;
    pub const BAD_PATTERN: i32 = -32009;
    pub const WATCH_FAILED: i32 = -32010;

    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, msg)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, msg)
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, msg)
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(
            Self::NOT_FOUND,
            format!("No such file or directory: {}", path),
        )
    }

    pub fn permission_denied(path: &str) -> Self {
        Self::new(
            Self::PERMISSION_DENIED,
            format!("Permission denied: {}", path),
        )
    }

    pub fn already_exists(path: &str) -> Self {
        Self::new(Self::ALREADY_EXISTS, format!("Already exists: {}", path))
    }

    pub fn is_a_directory(path: &str) -> Self {
        Self::new(Self::IS_A_DIRECTORY, format!("Is a directory: {}", path))
    }

    pub fn not_a_directory(path: &str) -> Self {
        Self::new(Self::NOT_A_DIRECTORY, format!("Not a directory: {}", path))
    }

    pub fn directory_not_empty(path: &str) -> Self {
        Self::new(
            Self::DIRECTORY_NOT_EMPTY,
            format!("Directory not empty: {}", path),
        )
    }

    pub fn cross_device(path: &str) -> Self {
        Self::new(Self::CROSS_DEVICE, format!("Cross-device rename: {}", path))
    }

    pub fn bad_pattern(msg: impl Into<String>) -> Self {
        Self::new(Self::BAD_PATTERN, msg)
    }

    pub fn watch_failed(msg: impl Into<String>) -> Self {
        Self::new(Self::WATCH_FAILED, msg)
    }

    pub fn io_error(err: std::io::Error) -> Self {
        Self::new(Self::IO_ERROR, err.to_string())
    }
}

// ============================================================================
// Filesystem wire types
// ============================================================================

/// Snapshot of a single directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub full_path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Raw st_mode bits
    pub mode: u32,
    /// Modification time, seconds since epoch
    pub time: i64,
    pub is_broken: bool,
    pub readable: bool,
    pub writable: bool,
    /// Resolved symlink target, absent for non-links and broken links
    pub target: Option<String>,
}

impl DirEntry {
    /// Entry for a path that no longer exists: name and path only.
    pub fn removed(path: &Path) -> Self {
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            full_path: path.to_string_lossy().into_owned(),
            is_dir: false,
            size: 0,
            mode: 0,
            time: 0,
            is_broken: false,
            readable: false,
            writable: false,
            target: None,
        }
    }
}

/// Change class delivered to directory subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
}

/// Payload handed to a subscription's change callback.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event: ChangeKind,
    pub file: DirEntry,
}
