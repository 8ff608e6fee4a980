use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};

use crate::error::MaskError;
use crate::metrics::BinaryMask;
use crate::util::has_extension;

pub const MASK_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MaskLabel {
    Background,
    Foreground,
}

impl MaskLabel {
    pub fn marker_color(self) -> [u8; 3] {
        match self {
            Self::Background => [0, 0, 0],
            Self::Foreground => [128, 0, 0],
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PaletteEntry {
    pub color: [u8; 3],
    pub label: MaskLabel,
}

/// Maps colors of a color-indexed mask to semantic labels. Entry order is the
/// palette index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaskPalette {
    entries: Vec<PaletteEntry>,
}

impl MaskPalette {
    pub fn new(entries: Vec<PaletteEntry>) -> Self {
        Self { entries }
    }

    /// The two end colors of the viridis colormap the segmenter renders masks with.
    pub fn viridis_binary() -> Self {
        Self::new(vec![
            PaletteEntry {
                color: [68, 1, 84],
                label: MaskLabel::Background,
            },
            PaletteEntry {
                color: [253, 231, 36],
                label: MaskLabel::Foreground,
            },
        ])
    }

    pub fn label_of(&self, color: [u8; 3]) -> Option<MaskLabel> {
        self.entries
            .iter()
            .find(|entry| entry.color == color)
            .map(|entry| entry.label)
    }

    /// Rewrites palette colors to label marker colors and returns the number
    /// of pixels changed. Colors outside the palette are left alone.
    pub fn remap(&self, image: &mut RgbImage) -> usize {
        let mut changed = 0;
        for pixel in image.pixels_mut() {
            if let Some(label) = self.label_of(pixel.0) {
                let marker = label.marker_color();
                if pixel.0 != marker {
                    *pixel = Rgb(marker);
                    changed += 1;
                }
            }
        }
        changed
    }
}

impl Default for MaskPalette {
    fn default() -> Self {
        Self::viridis_binary()
    }
}

pub fn load_binary_mask(path: &Path) -> Result<BinaryMask, MaskError> {
    let image = image::open(path).map_err(|source| MaskError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BinaryMask::from_luma(&image.to_luma8()))
}

pub fn save_binary_mask(mask: &BinaryMask, path: &Path) -> Result<(), MaskError> {
    let background = Rgb(MaskLabel::Background.marker_color());
    let foreground = Rgb(MaskLabel::Foreground.marker_color());
    let image = RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get(x, y) { foreground } else { background }
    });
    image.save(path).map_err(|source| MaskError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Applies the palette to a mask file in place. Returns the changed pixel count.
pub fn remap_mask_file(path: &Path, palette: &MaskPalette) -> Result<usize, MaskError> {
    let mut image = image::open(path)
        .map_err(|source| MaskError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let changed = palette.remap(&mut image);
    if changed > 0 {
        image.save(path).map_err(|source| MaskError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(changed)
}

/// Mask image files directly inside `dir`, sorted by file name.
pub fn list_mask_files(dir: &Path) -> Result<Vec<PathBuf>, MaskError> {
    let list_error = |source| MaskError::List {
        path: dir.to_path_buf(),
        source,
    };

    let mut masks = Vec::new();
    for entry in fs::read_dir(dir).map_err(list_error)? {
        let entry = entry.map_err(list_error)?;
        let path = entry.path();
        if path.is_file() && has_extension(&path, &MASK_EXTENSIONS) {
            masks.push(path);
        }
    }
    masks.sort();
    Ok(masks)
}
