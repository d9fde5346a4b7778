//! File metadata operations

use crate::protocol::{from_value, to_value, DirEntry, RpcError};
use serde::Deserialize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{bad_args, HandlerResult};

/// Get attributes of a single path
pub async fn get_info(params: &rmpv::Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct Params {
        path: String,
    }

    let params: Params =
        from_value(params.clone()).map_err(|e| bad_args(e, "{ path: string }"))?;

    let entry = entry_for(Path::new(&params.path)).await?;
    Ok(to_value(&entry))
}

/// Find a path that does not collide with an existing entry
pub async fn unique_path(params: &rmpv::Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct Params {
        path: String,
    }

    let params: Params =
        from_value(params.clone()).map_err(|e| bad_args(e, "{ path: string }"))?;

    let unique = allocate_unique(Path::new(&params.path)).await;
    Ok(rmpv::Value::from(unique.to_string_lossy().into_owned()))
}

// ============================================================================
// Helper functions
// ============================================================================

/// Build the entry snapshot for a path. The path itself is lstat'ed; for
/// symlinks the reported size/mode/time come from the resolved target, and a
/// link whose target cannot be resolved is flagged broken rather than failed.
pub async fn entry_for(path: &Path) -> Result<DirEntry, RpcError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    let meta = fs::symlink_metadata(path)
        .await
        .map_err(|e| map_io_error(e, &path.to_string_lossy()))?;
    Ok(entry_from_metadata(path, name, meta).await)
}

/// Same as `entry_for` but reuses metadata already obtained from a directory
/// scan.
pub async fn entry_from_metadata(path: &Path, name: String, meta: std::fs::Metadata) -> DirEntry {
    let mut attrs = meta.clone();
    let mut target = None;
    let mut is_broken = false;

    if meta.file_type().is_symlink() {
        match fs::canonicalize(path).await {
            Ok(resolved) => {
                target = Some(resolved.to_string_lossy().into_owned());
                if let Ok(followed) = fs::metadata(path).await {
                    attrs = followed;
                }
            }
            Err(_) => is_broken = true,
        }
    }

    DirEntry {
        name,
        full_path: path.to_string_lossy().into_owned(),
        is_dir: attrs.is_dir(),
        size: attrs.len(),
        mode: attrs.mode(),
        time: attrs.mtime(),
        is_broken,
        readable: access_ok(path, libc::R_OK),
        writable: access_ok(path, libc::W_OK),
        target,
    }
}

/// access(2) probe with the effective process identity.
pub(crate) fn access_ok(path: &Path, mode: libc::c_int) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let mut path_cstr = path.as_os_str().as_bytes().to_vec();
    path_cstr.push(0);
    unsafe { libc::access(path_cstr.as_ptr() as *const libc::c_char, mode) == 0 }
}

/// Return `desired` untouched when nothing exists there, otherwise the first
/// `<stem>_<n><ext>` sibling that is free. Advisory only: a concurrent create
/// can still take the returned path first.
async fn allocate_unique(desired: &Path) -> PathBuf {
    if !entry_exists(desired).await {
        return desired.to_path_buf();
    }

    let name = desired
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = split_base_name(&name);
    let parent = desired.parent().unwrap_or_else(|| Path::new(""));

    let mut n: u64 = 1;
    loop {
        let candidate = parent.join(format!("{}_{}{}", stem, n, ext));
        if !entry_exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

/// The extension starts at the last dot of the base name; names without a
/// dot, or starting with one, have no extension.
fn split_base_name(name: &str) -> (&str, &str) {
    if name.starts_with('.') {
        return (name, "");
    }
    match name.rfind('.') {
        Some(i) => (&name[..i], &name[i..]),
        None => (name, ""),
    }
}

/// Existence check that sees broken symlinks.
async fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

pub fn map_io_error(err: std::io::Error, path: &str) -> RpcError {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => RpcError::not_found(path),
        ErrorKind::PermissionDenied => RpcError::permission_denied(path),
        ErrorKind::AlreadyExists => RpcError::already_exists(path),
        ErrorKind::IsADirectory => RpcError::is_a_directory(path),
        ErrorKind::NotADirectory => RpcError::not_a_directory(path),
        ErrorKind::DirectoryNotEmpty => RpcError::directory_not_empty(path),
        ErrorKind::CrossesDevices => RpcError::cross_device(path),
        _ => RpcError::io_error(err),
    }
}
