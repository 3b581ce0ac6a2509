//! File-tree transfer used by the `dir` driver on the `filesystem` channel.
//!
//! Each volume is sent as a sequence of entry headers (JSON frames) followed
//! by raw content frames for regular files, terminated by an `end` header.
//! Several volumes (snapshots, then the root filesystem) reuse one channel
//! back to back, so the terminator is per-volume, not per-connection.

use crate::migration::channel::{Channel, ChannelError};
use crate::ops::OpContext;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    path:   String,
    kind:   EntryKind,
    mode:   u32,
    size:   u64,
    target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    Dir,
    File,
    Symlink,
    End,
}

/// Walks `root` and writes every entry to `conn`.
pub async fn send_tree(
    root: &Path,
    conn: &mut dyn Channel,
    ctx: &OpContext,
) -> Result<(), StorageError> {
    let entries = {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || walk(&root))
            .await
            .map_err(|e| StorageError::Driver(e.to_string()))??
    };

    for (rel, kind, mode, size, target) in entries {
        if ctx.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let header = EntryHeader {
            path: rel.to_string_lossy().into_owned(),
            kind,
            mode,
            size,
            target,
        };
        conn.send(serde_json::to_vec(&header).map_err(|e| StorageError::Driver(e.to_string()))?)
            .await?;

        if kind == EntryKind::File && size > 0 {
            let mut file = tokio::fs::File::open(root.join(&rel)).await?;
            let mut remaining = size;
            while remaining > 0 {
                if ctx.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let want = remaining.min(CHUNK_SIZE as u64) as usize;
                let mut buf = vec![0u8; want];
                file.read_exact(&mut buf).await?;
                conn.send(buf).await?;
                remaining -= want as u64;
            }
        }
    }

    let end = EntryHeader {
        path: String::new(),
        kind: EntryKind::End,
        mode: 0,
        size: 0,
        target: None,
    };
    conn.send(serde_json::to_vec(&end).map_err(|e| StorageError::Driver(e.to_string()))?)
        .await?;
    Ok(())
}

/// Reads one volume's entry sequence from `conn` into `root`.
pub async fn recv_tree(
    root: &Path,
    conn: &mut dyn Channel,
    ctx: &OpContext,
) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(root).await?;

    loop {
        if ctx.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let frame = conn
            .recv()
            .await?
            .ok_or(ChannelError::Closed)?;
        let header: EntryHeader = serde_json::from_slice(&frame)
            .map_err(|e| StorageError::Driver(format!("bad transfer header: {}", e)))?;

        match header.kind {
            EntryKind::End => return Ok(()),
            EntryKind::Dir => {
                let path = root.join(&header.path);
                tokio::fs::create_dir_all(&path).await?;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(header.mode))
                    .await?;
            }
            EntryKind::Symlink => {
                let path = root.join(&header.path);
                let target = header.target.unwrap_or_default();
                let _ = tokio::fs::remove_file(&path).await;
                tokio::fs::symlink(&target, &path).await?;
            }
            EntryKind::File => {
                let path = root.join(&header.path);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::File::create(&path).await?;
                let mut remaining = header.size;
                while remaining > 0 {
                    if ctx.is_cancelled() {
                        return Err(StorageError::Cancelled);
                    }
                    let chunk = conn
                        .recv()
                        .await?
                        .ok_or(ChannelError::Closed)?;
                    if chunk.len() as u64 > remaining {
                        return Err(StorageError::Driver(
                            "transfer chunk exceeds announced size".to_string(),
                        ));
                    }
                    file.write_all(&chunk).await?;
                    remaining -= chunk.len() as u64;
                }
                file.flush().await?;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(header.mode))
                    .await?;
            }
        }
    }
}

type WalkEntry = (PathBuf, EntryKind, u32, u64, Option<String>);

/// Depth-first walk returning paths relative to `root`, directories before
/// their contents.
fn walk(root: &Path) -> Result<Vec<WalkEntry>, std::io::Error> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut children: Vec<_> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        children.sort_by_key(|e| e.file_name());

        for entry in children {
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .expect("walk stays under root")
                .to_path_buf();
            let meta = std::fs::symlink_metadata(&path)?;
            let mode = meta.permissions().mode() & 0o7777;

            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(&path)?;
                out.push((
                    rel,
                    EntryKind::Symlink,
                    mode,
                    0,
                    Some(target.to_string_lossy().into_owned()),
                ));
            } else if meta.is_dir() {
                out.push((rel, EntryKind::Dir, mode, 0, None));
                stack.push(path);
            } else {
                out.push((rel, EntryKind::File, mode, meta.len(), None));
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::channel::MemChannel;
    use crate::ops::{Operation, OperationClass, OperationType};

    fn test_ctx() -> OpContext {
        Operation::new(
            "default",
            OperationClass::Task,
            OperationType::InstanceMigrate,
            Default::default(),
        )
        .context()
    }

    #[tokio::test]
    async fn tree_survives_transfer() {
        let src = tempdir("stream-src");
        let dst = tempdir("stream-dst");
        std::fs::create_dir_all(src.join("etc/sub")).unwrap();
        std::fs::write(src.join("etc/hostname"), b"web01\n").unwrap();
        std::fs::write(src.join("etc/sub/empty"), b"").unwrap();
        std::os::unix::fs::symlink("hostname", src.join("etc/hn")).unwrap();

        let (mut a, mut b) = MemChannel::pair();
        let ctx = test_ctx();
        let send_root = src.clone();
        let sender = tokio::spawn(async move {
            let ctx = test_ctx();
            send_tree(&send_root, &mut a, &ctx).await
        });
        recv_tree(&dst, &mut b, &ctx).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(
            std::fs::read(dst.join("etc/hostname")).unwrap(),
            b"web01\n"
        );
        assert!(dst.join("etc/sub/empty").exists());
        assert_eq!(
            std::fs::read_link(dst.join("etc/hn")).unwrap(),
            std::path::PathBuf::from("hostname")
        );

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dst).ok();
    }

    fn tempdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "corral-{}-{}",
            tag,
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
