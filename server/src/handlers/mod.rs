//! Request handlers for the filesystem operations

pub mod dir;
pub mod file;
pub mod io;

use crate::connection::ClientHandle;
use crate::protocol::{Request, Response, RpcError};
use crate::watcher::WatchMux;
use rmpv::Value;
use std::sync::Arc;

pub type HandlerResult = Result<Value, RpcError>;

/// State shared by every handler, constructed once at startup.
pub struct ServerState {
    pub watcher: Arc<WatchMux>,
}

/// First positional argument of the request envelope: the operation's
/// parameter record.
pub(crate) fn first_param(params: &Value) -> Value {
    params
        .as_array()
        .and_then(|a| a.first())
        .cloned()
        .unwrap_or(Value::Nil)
}

/// Decode-failure error carrying the expected parameter schema.
pub(crate) fn bad_args(err: impl std::fmt::Display, schema: &str) -> RpcError {
    RpcError::invalid_params(format!("{}; expected {}", err, schema))
}

/// Dispatch a request to the appropriate handler
pub async fn dispatch(state: &Arc<ServerState>, request: &Request, client: &ClientHandle) -> Response {
    let param = first_param(&request.params);

    let result = match request.method.as_str() {
        // Directory operations
        "ReadDirectory" => dir::read_directory(state, client, &request.username, &param).await,
        "CreateDirectory" => dir::create_directory(&param).await,
        "Glob" => dir::glob(&param).await,

        // File metadata operations
        "GetInfo" => file::get_info(&param).await,
        "UniquePath" => file::unique_path(&param).await,

        // File I/O operations
        "ReadFile" => io::read_file(&param).await,
        "WriteFile" => io::write_file(&param).await,
        "Remove" => io::remove(&param).await,
        "SetPermissions" => io::set_permissions(&param).await,
        "Copy" => io::copy(&param).await,

        // Move is an alias of Rename: no cross-device fallback
        "Rename" | "Move" => io::rename(&param).await,

        _ => Err(RpcError::method_not_found(&request.method)),
    };

    match result {
        Ok(value) => Response::success(request.id.clone(), value),
        Err(error) => Response::error(Some(request.id.clone()), error),
    }
}
