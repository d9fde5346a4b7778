//! File I/O operations

use rmpv::Value;
use serde::Deserialize;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::file::map_io_error;
use super::{bad_args, HandlerResult};
use crate::protocol::from_value;

/// Read entire file contents
pub async fn read_file(params: &Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct Params {
        path: String,
    }

    let params: Params =
        from_value(params.clone()).map_err(|e| bad_args(e, "{ path: string }"))?;

    let content = fs::read(&params.path)
        .await
        .map_err(|e| map_io_error(e, &params.path))?;

    Ok(Value::Binary(content))
}

/// Write file contents, returning the number of bytes written
pub async fn write_file(params: &Value) -> HandlerResult {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Params {
        path: String,
        /// Content to write as binary
        #[serde(with = "serde_bytes")]
        content: Vec<u8>,
        /// Fail if the file already exists
        #[serde(default)]
        do_not_overwrite: bool,
        /// Open-or-create and write at the end; wins over doNotOverwrite
        #[serde(default)]
        append: bool,
    }

    let params: Params = from_value(params.clone()).map_err(|e| {
        bad_args(
            e,
            "{ path: string, content: bytes, doNotOverwrite?: bool, append?: bool }",
        )
    })?;

    let mut options = OpenOptions::new();
    if params.append {
        options.append(true).create(true);
    } else if params.do_not_overwrite {
        options.write(true).create_new(true);
    } else {
        options.write(true).create(true).truncate(true);
    }

    let mut file = options
        .open(&params.path)
        .await
        .map_err(|e| map_io_error(e, &params.path))?;

    file.write_all(&params.content)
        .await
        .map_err(|e| map_io_error(e, &params.path))?;
    file.flush()
        .await
        .map_err(|e| map_io_error(e, &params.path))?;

    Ok(Value::from(params.content.len() as u64))
}

/// Remove a file or directory
pub async fn remove(params: &Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct Params {
        path: String,
        #[serde(default)]
        recursive: bool,
    }

    let params: Params = from_value(params.clone())
        .map_err(|e| bad_args(e, "{ path: string, recursive?: bool }"))?;

    let path = Path::new(&params.path);
    let meta = fs::symlink_metadata(path)
        .await
        .map_err(|e| map_io_error(e, &params.path))?;

    let result = if meta.is_dir() {
        if params.recursive {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_dir(path).await
        }
    } else {
        // Symlinks are removed without following
        fs::remove_file(path).await
    };
    result.map_err(|e| map_io_error(e, &params.path))?;

    Ok(Value::Boolean(true))
}

/// Rename a file or directory. Atomic on one filesystem; cross-device
/// renames fail. `Move` dispatches here as well.
pub async fn rename(params: &Value) -> HandlerResult {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Params {
        old_path: String,
        new_path: String,
    }

    let params: Params = from_value(params.clone())
        .map_err(|e| bad_args(e, "{ oldPath: string, newPath: string }"))?;

    fs::rename(&params.old_path, &params.new_path)
        .await
        .map_err(|e| map_io_error(e, &params.old_path))?;

    Ok(Value::Boolean(true))
}

/// Copy a file, directory tree, or symlink
pub async fn copy(params: &Value) -> HandlerResult {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Params {
        src_path: String,
        dst_path: String,
    }

    let params: Params = from_value(params.clone())
        .map_err(|e| bad_args(e, "{ srcPath: string, dstPath: string }"))?;

    copy_any(Path::new(&params.src_path), Path::new(&params.dst_path))
        .await
        .map_err(|e| map_io_error(e, &params.src_path))?;

    Ok(Value::Boolean(true))
}

/// Recursive copy. Regular files carry content and mode, directories are
/// recreated with the source mode, symlinks are duplicated as links.
/// Existing destination entries are overwritten; a failure part-way leaves
/// earlier copies in place.
async fn copy_any(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(src).await?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let link_target = fs::read_link(src).await?;
        match fs::symlink(&link_target, dst).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                fs::remove_file(dst).await?;
                fs::symlink(&link_target, dst).await
            }
            Err(e) => Err(e),
        }
    } else if file_type.is_dir() {
        match fs::create_dir(dst).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = fs::symlink_metadata(dst).await?;
                if !existing.is_dir() {
                    fs::remove_file(dst).await?;
                    fs::create_dir(dst).await?;
                }
            }
            Err(e) => return Err(e),
        }
        fs::set_permissions(dst, meta.permissions()).await?;

        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dst_child = dst.join(entry.file_name());
            Box::pin(copy_any(&entry.path(), &dst_child)).await?;
        }
        Ok(())
    } else {
        fs::copy(src, dst).await.map(|_| ())
    }
}

/// Set permission bits, optionally across a whole subtree
pub async fn set_permissions(params: &Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct Params {
        path: String,
        mode: u32,
        #[serde(default)]
        recursive: bool,
    }

    let params: Params = from_value(params.clone())
        .map_err(|e| bad_args(e, "{ path: string, mode: integer, recursive?: bool }"))?;

    let path = Path::new(&params.path);
    if params.recursive {
        set_modes_recursive(path, params.mode)
            .await
            .map_err(|e| map_io_error(e, &params.path))?;
    } else {
        fs::set_permissions(path, std::fs::Permissions::from_mode(params.mode))
            .await
            .map_err(|e| map_io_error(e, &params.path))?;
    }

    Ok(Value::Boolean(true))
}

/// Depth-first walk applying `mode` to every entry. The first error aborts
/// the walk; entries already changed stay changed.
async fn set_modes_recursive(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;

    let meta = fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            Box::pin(set_modes_recursive(&entry.path(), mode)).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgpack_map;
    use crate::protocol::RpcError;
    use std::os::unix::fs::MetadataExt;

    fn path_param(path: &Path) -> Value {
        msgpack_map! { "path" => path.to_string_lossy().into_owned() }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");

        let written = write_file(&msgpack_map! {
            "path" => path.to_string_lossy().into_owned(),
            "content" => Value::Binary(vec![1, 2, 3])
        })
        .await
        .unwrap();
        assert_eq!(written.as_u64(), Some(3));

        let content = read_file(&path_param(&path)).await.unwrap();
        assert_eq!(content.as_slice(), Some(&[1u8, 2, 3][..]));

        let err = write_file(&msgpack_map! {
            "path" => path.to_string_lossy().into_owned(),
            "content" => Value::Binary(vec![4]),
            "doNotOverwrite" => true
        })
        .await
        .unwrap_err();
        assert_eq!(err.code, RpcError::ALREADY_EXISTS);
    }

    #[tokio::test]
    async fn append_wins_over_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        tokio::fs::write(&path, b"ab").await.unwrap();

        write_file(&msgpack_map! {
            "path" => path.to_string_lossy().into_owned(),
            "content" => Value::Binary(b"cd".to_vec()),
            "doNotOverwrite" => true,
            "append" => true
        })
        .await
        .unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn plain_write_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        tokio::fs::write(&path, b"longer content").await.unwrap();

        write_file(&msgpack_map! {
            "path" => path.to_string_lossy().into_owned(),
            "content" => Value::Binary(b"x".to_vec())
        })
        .await
        .unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn read_file_maps_common_errors() {
        let dir = tempfile::tempdir().unwrap();

        let err = read_file(&path_param(&dir.path().join("nope")))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::NOT_FOUND);

        let err = read_file(&path_param(dir.path())).await.unwrap_err();
        assert_eq!(err.code, RpcError::IS_A_DIRECTORY);
    }

    #[tokio::test]
    async fn remove_refuses_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        tokio::fs::create_dir(&sub).await.unwrap();
        tokio::fs::write(sub.join("f"), b"x").await.unwrap();

        let err = remove(&path_param(&sub)).await.unwrap_err();
        assert_eq!(err.code, RpcError::DIRECTORY_NOT_EMPTY);

        remove(&msgpack_map! {
            "path" => sub.to_string_lossy().into_owned(),
            "recursive" => true
        })
        .await
        .unwrap();
        assert!(tokio::fs::symlink_metadata(&sub).await.is_err());
    }

    #[tokio::test]
    async fn remove_unlinks_symlink_not_referent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("real");
        tokio::fs::write(&file, b"x").await.unwrap();
        let link = dir.path().join("link");
        tokio::fs::symlink(&file, &link).await.unwrap();

        remove(&path_param(&link)).await.unwrap();
        assert!(tokio::fs::symlink_metadata(&link).await.is_err());
        assert!(tokio::fs::symlink_metadata(&file).await.is_ok());
    }

    #[tokio::test]
    async fn rename_moves_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        tokio::fs::write(&old, b"x").await.unwrap();

        rename(&msgpack_map! {
            "oldPath" => old.to_string_lossy().into_owned(),
            "newPath" => new.to_string_lossy().into_owned()
        })
        .await
        .unwrap();

        assert!(tokio::fs::symlink_metadata(&old).await.is_err());
        assert_eq!(tokio::fs::read(&new).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn copy_preserves_content_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        tokio::fs::create_dir(&src).await.unwrap();
        let file = src.join("f");
        tokio::fs::write(&file, &[9u8]).await.unwrap();
        tokio::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640))
            .await
            .unwrap();

        copy(&msgpack_map! {
            "srcPath" => src.to_string_lossy().into_owned(),
            "dstPath" => dst.to_string_lossy().into_owned()
        })
        .await
        .unwrap();

        let copied = dst.join("f");
        assert_eq!(tokio::fs::read(&copied).await.unwrap(), &[9u8]);
        let mode = tokio::fs::metadata(&copied).await.unwrap().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn copy_duplicates_symlinks_as_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        tokio::fs::create_dir(&src).await.unwrap();
        tokio::fs::write(src.join("real"), b"x").await.unwrap();
        tokio::fs::symlink("real", src.join("link")).await.unwrap();

        let dst = dir.path().join("dst");
        copy(&msgpack_map! {
            "srcPath" => src.to_string_lossy().into_owned(),
            "dstPath" => dst.to_string_lossy().into_owned()
        })
        .await
        .unwrap();

        let copied = dst.join("link");
        let meta = tokio::fs::symlink_metadata(&copied).await.unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            tokio::fs::read_link(&copied).await.unwrap(),
            Path::new("real")
        );
    }

    #[tokio::test]
    async fn copy_overwrites_existing_destination_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        tokio::fs::create_dir(&src).await.unwrap();
        tokio::fs::create_dir(&dst).await.unwrap();
        tokio::fs::write(src.join("f"), b"new").await.unwrap();
        tokio::fs::write(dst.join("f"), b"old").await.unwrap();

        copy(&msgpack_map! {
            "srcPath" => src.to_string_lossy().into_owned(),
            "dstPath" => dst.to_string_lossy().into_owned()
        })
        .await
        .unwrap();

        assert_eq!(tokio::fs::read(dst.join("f")).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn set_permissions_recursive_covers_the_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        tokio::fs::create_dir_all(root.join("sub")).await.unwrap();
        tokio::fs::write(root.join("f"), b"x").await.unwrap();
        tokio::fs::write(root.join("sub/g"), b"y").await.unwrap();

        set_permissions(&msgpack_map! {
            "path" => root.to_string_lossy().into_owned(),
            "mode" => Value::from(0o750u64),
            "recursive" => true
        })
        .await
        .unwrap();

        for p in [root.clone(), root.join("sub"), root.join("f"), root.join("sub/g")] {
            let mode = tokio::fs::symlink_metadata(&p).await.unwrap().mode();
            assert_eq!(mode & 0o777, 0o750, "wrong mode on {}", p.display());
        }
    }

    #[tokio::test]
    async fn missing_required_field_names_the_schema() {
        let err = write_file(&msgpack_map! { "content" => Value::Binary(vec![]) })
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcError::INVALID_PARAMS);
        assert!(err.message.contains("path"), "message: {}", err.message);
    }
}
