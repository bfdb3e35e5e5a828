//! `<split>/<class>/<image>` directory trees (ImageNet layout), decoded lazily.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fast_image_resize::images::Image as FirImage;
use fast_image_resize::{
    FilterType as FirFilterType, PixelType as FirPixelType, ResizeAlg as FirResizeAlg,
    ResizeOptions as FirResizeOptions, Resizer as FirResizer,
};
use tracing::info;

use psw_core::dataset::{Dataset, DatasetError, ImageStore};
use psw_core::image::{Image, ImageShape};
use psw_core::types::ClassId;

use crate::DataError;

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png"];

fn walk_files(root: &Path) -> Result<Vec<(PathBuf, String)>, DataError> {
    let mut out: Vec<(PathBuf, String)> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() && has_image_ext(&path) {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push((path, rel));
            }
        }
    }
    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}

fn has_image_ext(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn class_for_rel(rel: &str) -> Option<&str> {
    let (label, _tail) = rel.trim_matches('/').split_once('/')?;
    let label = label.trim();
    (!label.is_empty()).then_some(label)
}

/// Sorted class directory names of a split; the position is the class id.
pub fn scan_classes(split_dir: &Path) -> Result<Vec<String>, DataError> {
    if !split_dir.is_dir() {
        return Err(DataError::Missing(split_dir.to_path_buf()));
    }
    let mut classes = Vec::new();
    for entry in std::fs::read_dir(split_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            classes.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    classes.sort();
    if classes.is_empty() {
        return Err(DataError::ImageFolder(format!(
            "no class directories under {}",
            split_dir.display()
        )));
    }
    Ok(classes)
}

/// Image store that decodes and resizes from disk on every access.
#[derive(Debug, Clone)]
pub struct ImageFolderStore {
    shape: ImageShape,
    files: Arc<[PathBuf]>,
}

impl ImageStore for ImageFolderStore {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn load(&self, index: usize) -> Result<Image, DatasetError> {
        let path = self.files.get(index).ok_or(DatasetError::IndexOutOfRange {
            index,
            len: self.files.len(),
        })?;
        let bytes = std::fs::read(path).map_err(|e| DatasetError::Load {
            index,
            detail: format!("{}: {e}", path.display()),
        })?;
        let rgb = decode_rgb(&bytes, self.shape.height, self.shape.width).map_err(|detail| {
            DatasetError::Load {
                index,
                detail: format!("{}: {detail}", path.display()),
            }
        })?;
        Ok(Image::from_hwc_u8(self.shape, &rgb)?)
    }
}

/// Decodes JPEG/PNG bytes to packed RGB at exactly `height x width`.
pub fn decode_rgb(bytes: &[u8], height: usize, width: usize) -> Result<Vec<u8>, String> {
    let decoded = ::image::load_from_memory(bytes).map_err(|e| format!("decode failed: {e}"))?;
    let rgb = decoded.to_rgb8();
    let (src_w, src_h) = (rgb.width(), rgb.height());
    let dst_w = u32::try_from(width).map_err(|_| "width overflow".to_string())?;
    let dst_h = u32::try_from(height).map_err(|_| "height overflow".to_string())?;
    if src_w == dst_w && src_h == dst_h {
        return Ok(rgb.into_raw());
    }

    let src = FirImage::from_vec_u8(src_w, src_h, rgb.into_raw(), FirPixelType::U8x3)
        .map_err(|e| format!("resize source init failed: {e}"))?;
    let mut dst = FirImage::new(dst_w, dst_h, FirPixelType::U8x3);
    let options =
        FirResizeOptions::new().resize_alg(FirResizeAlg::Convolution(FirFilterType::Bilinear));
    FirResizer::new()
        .resize(&src, &mut dst, &options)
        .map_err(|e| format!("resize failed: {e}"))?;
    Ok(dst.into_vec())
}

/// Builds a lazily decoded dataset from `split_dir`, labeling by `classes`.
pub fn load_image_folder(
    split_dir: &Path,
    classes: &[String],
    shape: ImageShape,
) -> Result<Dataset, DataError> {
    if !split_dir.is_dir() {
        return Err(DataError::Missing(split_dir.to_path_buf()));
    }
    let ids: BTreeMap<&str, u32> = classes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i as u32))
        .collect();

    let mut files = Vec::new();
    let mut labels = Vec::new();
    for (path, rel) in walk_files(split_dir)? {
        let class = class_for_rel(&rel).ok_or_else(|| {
            DataError::ImageFolder(format!("{rel}: image outside a class directory"))
        })?;
        let id = ids.get(class).ok_or_else(|| {
            DataError::ImageFolder(format!("{rel}: unknown class {class:?}"))
        })?;
        files.push(path);
        labels.push(ClassId(*id));
    }
    if files.is_empty() {
        return Err(DataError::ImageFolder(format!(
            "no images under {}",
            split_dir.display()
        )));
    }
    info!(
        dir = %split_dir.display(),
        images = files.len(),
        classes = classes.len(),
        "indexed image folder"
    );

    let store = ImageFolderStore {
        shape,
        files: files.into(),
    };
    let name = split_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(Dataset::new(
        format!("imagefolder-{name}"),
        classes.len(),
        Arc::new(store),
        labels,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_is_first_component() {
        assert_eq!(class_for_rel("n01440764/img.JPEG"), Some("n01440764"));
        assert_eq!(class_for_rel("loose.jpg"), None);
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        assert!(has_image_ext(Path::new("a/b.JPEG")));
        assert!(has_image_ext(Path::new("a/b.png")));
        assert!(!has_image_ext(Path::new("a/b.txt")));
    }
}
