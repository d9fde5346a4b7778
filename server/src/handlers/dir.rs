//! Directory operations

use rmpv::Value;
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

use super::file::{entry_from_metadata, map_io_error};
use super::{bad_args, HandlerResult, ServerState};
use crate::connection::ClientHandle;
use crate::msgpack_map;
use crate::protocol::{from_value, to_value, DirEntry, RpcError};
use crate::watcher::WatchMux;

/// List a directory's immediate children, optionally subscribing the caller
/// to changes. The `stopWatching` key is present iff `onChange` was supplied.
pub async fn read_directory(
    state: &ServerState,
    client: &ClientHandle,
    username: &str,
    params: &Value,
) -> HandlerResult {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Params {
        path: String,
        /// Client-side callback handle for change events
        on_change: Option<u64>,
    }

    let params: Params = from_value(params.clone())
        .map_err(|e| bad_args(e, "{ path: string, onChange?: callback }"))?;

    let files = list_dir(Path::new(&params.path)).await?;
    let files = to_value(&files);

    let Some(on_change) = params.on_change else {
        return Ok(msgpack_map! { "files" => files });
    };

    let callback = client.remote_callback(on_change);
    let stop = WatchMux::subscribe(
        &state.watcher,
        Path::new(&params.path),
        username,
        callback,
        client,
    )
    .map_err(|e| RpcError::watch_failed(e.to_string()))?;
    let stop_id = client.register_callback(move |_| stop.stop());

    Ok(msgpack_map! {
        "files" => files,
        "stopWatching" => stop_id
    })
}

/// Enumerate immediate children, hidden entries included, sorted byte-wise
/// ascending by name so clients can diff listings deterministically.
async fn list_dir(path: &Path) -> Result<Vec<DirEntry>, RpcError> {
    let path_str = path.to_string_lossy();
    let mut entries = fs::read_dir(path)
        .await
        .map_err(|e| map_io_error(e, &path_str))?;

    let mut files: Vec<DirEntry> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| map_io_error(e, &path_str))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        // An entry may vanish between the scan and the stat; skip it.
        match entry.metadata().await {
            Ok(meta) => files.push(entry_from_metadata(&entry.path(), name, meta).await),
            Err(_) => continue,
        }
    }

    files.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    Ok(files)
}

/// Create a directory
pub async fn create_directory(params: &Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct Params {
        path: String,
        /// Create missing parents; succeeds if the final directory exists
        #[serde(default)]
        recursive: bool,
    }

    let params: Params = from_value(params.clone())
        .map_err(|e| bad_args(e, "{ path: string, recursive?: bool }"))?;

    let result = if params.recursive {
        fs::create_dir_all(&params.path).await
    } else {
        fs::create_dir(&params.path).await
    };
    result.map_err(|e| map_io_error(e, &params.path))?;

    Ok(Value::Boolean(true))
}

/// Expand a glob pattern against the filesystem
pub async fn glob(params: &Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct Params {
        pattern: String,
    }

    let params: Params =
        from_value(params.clone()).map_err(|e| bad_args(e, "{ pattern: string }"))?;

    // The matcher walks the filesystem synchronously
    let matches = tokio::task::spawn_blocking(move || -> Result<Vec<String>, RpcError> {
        let paths = glob::glob(&params.pattern)
            .map_err(|e| RpcError::bad_pattern(format!("Bad pattern: {}", e)))?;
        Ok(paths
            .filter_map(Result::ok)
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    })
    .await
    .map_err(|e| RpcError::internal_error(e.to_string()))??;

    Ok(to_value(&matches))
}
