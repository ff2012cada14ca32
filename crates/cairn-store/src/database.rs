//! Persistent key → chunk databases.
//!
//! `FsDatabase` keeps one file per chunk in a two-level directory layout:
//!   {root}/{key[0..1] as hex}/{full key as hex}
//!
//! Files are immutable: if the key exists, the content is correct.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use bytes::Bytes;
use cairn_core::ContentKey;
use dashmap::DashMap;
use memmap2::Mmap;

use crate::error::DbError;

/// Durable key-value storage for chunk data. Unbounded.
pub trait Database: Send + Sync {
    fn get(&self, key: &ContentKey) -> Result<Option<Bytes>, DbError>;

    fn put(&self, key: &ContentKey, data: &[u8]) -> Result<(), DbError>;

    fn contains(&self, key: &ContentKey) -> Result<bool, DbError> {
        Ok(self.get(key)?.is_some())
    }
}

// ── FsDatabase ────────────────────────────────────────────────────────────────

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct FsDatabase {
    root: PathBuf,
}

impl FsDatabase {
    /// Open (creating if needed) a database rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DbError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create database root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn chunk_path(&self, key: &ContentKey) -> Result<PathBuf, DbError> {
        if key.is_empty() {
            return Err(DbError::EmptyKey);
        }
        let hex = key.to_string();
        Ok(self.root.join(&hex[0..2]).join(&hex))
    }

    /// Count stored chunks (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir
                        .flatten()
                        .filter(|e| e.path().extension().is_none())
                        .count();
                }
            }
        }
        total
    }
}

impl Database for FsDatabase {
    /// The returned bytes are copied out of a read-only mmap.
    fn get(&self, key: &ContentKey) -> Result<Option<Bytes>, DbError> {
        let path = self.chunk_path(key)?;
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open chunk: {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat chunk: {}", path.display()))?
            .len();
        if len == 0 {
            // mmap of an empty file fails on some platforms.
            return Ok(Some(Bytes::new()));
        }

        // Safety: file is opened read-only and we don't mutate the mmap
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap chunk: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Writes are atomic: write to a temp file, then rename. Existing keys are
    /// left untouched.
    fn put(&self, key: &ContentKey, data: &[u8]) -> Result<(), DbError> {
        let path = self.chunk_path(key)?;
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create chunk dir: {}", parent.display()))?;
        }

        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("{}.{n}.tmp", std::process::id()));
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write chunk data")?;
            file.sync_all().context("failed to sync chunk to disk")?;
        }

        fs::rename(&tmp_path, &path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;

        tracing::trace!(key = %key.short(), len = data.len(), "chunk persisted");
        Ok(())
    }

    fn contains(&self, key: &ContentKey) -> Result<bool, DbError> {
        Ok(self.chunk_path(key)?.exists())
    }
}

// ── MemDatabase ───────────────────────────────────────────────────────────────

/// Volatile database for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemDatabase {
    chunks: DashMap<ContentKey, Bytes>,
}

impl MemDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Database for MemDatabase {
    fn get(&self, key: &ContentKey) -> Result<Option<Bytes>, DbError> {
        Ok(self.chunks.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &ContentKey, data: &[u8]) -> Result<(), DbError> {
        self.chunks
            .entry(key.clone())
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(())
    }

    fn contains(&self, key: &ContentKey) -> Result<bool, DbError> {
        Ok(self.chunks.contains_key(key))
    }
}
