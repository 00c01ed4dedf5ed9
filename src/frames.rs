use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use image::RgbaImage;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FrameId(pub usize);

/// A rendered frame reference and the turn it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameAsset {
    pub id: FrameId,
    pub turn_index: usize,
    /// Settled frame of the turn's reveal, held while its audio plays.
    pub is_final_for_turn: bool,
}

#[derive(Debug, Clone)]
struct StoredFrame {
    asset: FrameAsset,
    image: Arc<RgbaImage>,
    path: Option<PathBuf>,
}

/// Owns the pixels of every rendered frame. Frames are addressed by
/// [`FrameId`]; metadata travels on the [`FrameAsset`], never in file names.
#[derive(Debug, Clone)]
pub struct FrameStore {
    width: u32,
    height: u32,
    frames: Vec<StoredFrame>,
}

impl FrameStore {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(
        &mut self,
        turn_index: usize,
        is_final_for_turn: bool,
        image: RgbaImage,
    ) -> Result<FrameAsset> {
        if image.width() != self.width || image.height() != self.height {
            bail!(
                "frame size mismatch: expected {}x{}, got {}x{}",
                self.width,
                self.height,
                image.width(),
                image.height()
            );
        }
        let asset = FrameAsset {
            id: FrameId(self.frames.len()),
            turn_index,
            is_final_for_turn,
        };
        self.frames.push(StoredFrame {
            asset,
            image: Arc::new(image),
            path: None,
        });
        Ok(asset)
    }

    pub fn image(&self, id: FrameId) -> Option<&RgbaImage> {
        self.frames.get(id.0).map(|frame| frame.image.as_ref())
    }

    pub fn path(&self, id: FrameId) -> Option<&Path> {
        self.frames.get(id.0).and_then(|frame| frame.path.as_deref())
    }

    pub fn assets(&self) -> impl Iterator<Item = &FrameAsset> {
        self.frames.iter().map(|frame| &frame.asset)
    }

    /// Writes every frame as PNG into `dir` and records the paths.
    pub fn persist(&mut self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create frame directory {}", dir.display()))?;
        for frame in &mut self.frames {
            let path = dir.join(format!("frame_{:04}.png", frame.asset.id.0));
            frame
                .image
                .save(&path)
                .with_context(|| format!("failed to write frame {}", path.display()))?;
            frame.path = Some(path);
        }
        Ok(())
    }

    /// Hash over dimensions, metadata and pixels of every frame in order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.width.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        for frame in &self.frames {
            hasher.update((frame.asset.turn_index as u64).to_le_bytes());
            hasher.update([u8::from(frame.asset.is_final_for_turn)]);
            hasher.update(frame.image.as_raw());
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}
