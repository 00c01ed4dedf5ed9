use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use fontdue::Font;
use sha2::{Digest, Sha256};

pub const REGULAR_FONT_CANDIDATES: [&str; 8] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/SFNSText.ttf",
    "/System/Library/Fonts/SFNSDisplay.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

pub const BOLD_FONT_CANDIDATES: [&str; 5] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "C:\\Windows\\Fonts\\arialbd.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
];

/// Glyphs every usable face must carry.
const REQUIRED_GLYPHS: &str = "AaZz09?!";

/// A parsed face together with where it came from and its content hash.
pub struct LoadedFont {
    pub font: Font,
    pub path: PathBuf,
    pub sha256: String,
}

impl std::fmt::Debug for LoadedFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedFont")
            .field("path", &self.path)
            .field("sha256", &self.sha256)
            .finish()
    }
}

/// Uses the configured path when given (it must exist), otherwise the first
/// candidate present on this machine.
pub fn resolve_font_path(configured: Option<&Path>, candidates: &[&str]) -> Result<PathBuf> {
    if let Some(path) = configured {
        if !path.is_file() {
            bail!("configured font '{}' does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .ok_or_else(|| {
            anyhow!(
                "could not find any suitable font. Install a TrueType font or set paths.font / CHATREEL_FONT. Searched: {}",
                candidates.join(", ")
            )
        })
}

pub fn load_font(path: &Path) -> Result<LoadedFont> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read font file '{}'", path.display()))?;
    let sha256 = sha256_hex(&bytes);
    let font = Font::from_bytes(bytes, fontdue::FontSettings::default())
        .map_err(|error| anyhow!("failed to parse font {}: {error}", path.display()))?;
    ensure_supported_codepoints(&font, REQUIRED_GLYPHS, &path.display().to_string())?;
    Ok(LoadedFont {
        font,
        path: path.to_path_buf(),
        sha256,
    })
}

/// Resolves and loads the regular face and the bold face. The bold face
/// falls back to the regular one when no bold candidate exists.
pub fn load_font_pair(
    regular: Option<&Path>,
    bold: Option<&Path>,
) -> Result<(LoadedFont, LoadedFont)> {
    let regular_path = resolve_font_path(regular, &REGULAR_FONT_CANDIDATES)?;
    let bold_path = match bold {
        Some(path) => resolve_font_path(Some(path), &BOLD_FONT_CANDIDATES)?,
        None => resolve_font_path(None, &BOLD_FONT_CANDIDATES).unwrap_or_else(|_| regular_path.clone()),
    };
    Ok((load_font(&regular_path)?, load_font(&bold_path)?))
}

pub fn ensure_supported_codepoints(font: &Font, text: &str, font_name: &str) -> Result<()> {
    for ch in text.chars() {
        if matches!(ch, '\n' | '\r' | '\t' | ' ') {
            continue;
        }
        if font.lookup_glyph_index(ch) == 0 {
            return Err(anyhow!(
                "unsupported codepoint U+{:04X} ({}) in font {}",
                ch as u32,
                ch.escape_default(),
                font_name
            ));
        }
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
