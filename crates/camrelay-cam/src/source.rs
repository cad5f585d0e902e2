//! Frame sources for the camera daemon.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};

use camrelay_core::wire::{FRAME_END, FRAME_START};
use camrelay_services::FrameSource;

/// Cycles through the `.jpg`/`.jpeg` files of a directory in name order.
/// Files are re-read on every capture, so they can be replaced while running.
pub struct DirectorySource {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
            let path = entry?.path();
            let is_jpeg = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
            if is_jpeg && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            bail!("no .jpg files in {}", dir.display());
        }
        files.sort();
        Ok(Self { files, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

impl FrameSource for DirectorySource {
    fn capture(&mut self) -> Result<Bytes> {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        // Capture runs on the supervisor task; keep file I/O off the async workers.
        let data = tokio::task::block_in_place(|| std::fs::read(path))
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Bytes::from(data))
    }
}

/// Produces small marker-bracketed frames carrying a counter. Used when no
/// frame directory is configured.
#[derive(Default)]
pub struct SyntheticSource {
    counter: u64,
}

impl FrameSource for SyntheticSource {
    fn capture(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(FRAME_START.len() + 8 + FRAME_END.len());
        buf.put_slice(&FRAME_START);
        // Keep every body byte below 0xFF so no marker appears inside.
        for b in self.counter.to_be_bytes() {
            buf.put_u8(b & 0x7F);
        }
        buf.put_slice(&FRAME_END);
        self.counter += 1;
        Ok(buf.freeze())
    }
}
