use std::fs::{self, File};
use std::io::BufReader;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::config::ImagesConfig;
use crate::core::Environment;
use crate::error::StageError;
use crate::hash::Hash32;
use crate::pipeline::{Asset, Stage};

/// Image formats the optimiser knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
    Svg,
}

impl ImageKind {
    pub fn from_path(path: &Utf8Path) -> Option<Self> {
        let ext = path.extension()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            "svg" => Some(Self::Svg),
            _ => None,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::Svg => "svg",
        }
    }
}

/// An image compression engine.
pub trait Compressor: Send + Sync {
    /// Identifies the engine together with its settings. Cache entries made
    /// with a different fingerprint are never reused.
    fn fingerprint(&self) -> String;

    fn compress(&self, kind: ImageKind, data: &[u8]) -> Result<Vec<u8>, StageError>;
}

/// Re-encodes raster images with the `image` crate.
///
/// GIF and SVG are passed through as they are. The original bytes are kept
/// whenever re-encoding does not make the file smaller.
#[derive(Debug, Clone, Copy)]
pub struct ImageOptimizer {
    png_level: u8,
    jpeg_quality: u8,
}

impl ImageOptimizer {
    pub fn new(config: &ImagesConfig) -> Self {
        Self {
            png_level: config.png_level.min(6),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
        }
    }

    fn png(&self, data: &[u8]) -> Result<Vec<u8>, StageError> {
        let img = image::load_from_memory_with_format(data, image::ImageFormat::Png)?;

        let (compression, filter) = match self.png_level {
            0 => (CompressionType::Fast, FilterType::NoFilter),
            1 | 2 => (CompressionType::Default, FilterType::Sub),
            _ => (CompressionType::Best, FilterType::Adaptive),
        };

        let mut out = Vec::new();
        PngEncoder::new_with_quality(&mut out, compression, filter).write_image(
            img.as_bytes(),
            img.width(),
            img.height(),
            ExtendedColorType::from(img.color()),
        )?;

        Ok(out)
    }

    fn jpeg(&self, data: &[u8]) -> Result<Vec<u8>, StageError> {
        let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?;
        let rgb = img.to_rgb8();

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.jpeg_quality).write_image(
            &rgb,
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;

        Ok(out)
    }
}

impl Compressor for ImageOptimizer {
    fn fingerprint(&self) -> String {
        format!("image/png{}/jpeg{}", self.png_level, self.jpeg_quality)
    }

    fn compress(&self, kind: ImageKind, data: &[u8]) -> Result<Vec<u8>, StageError> {
        let out = match kind {
            ImageKind::Png => self.png(data)?,
            ImageKind::Jpeg => self.jpeg(data)?,
            ImageKind::Gif | ImageKind::Svg => return Ok(data.to_vec()),
        };

        if out.len() < data.len() {
            Ok(out)
        } else {
            Ok(data.to_vec())
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    fingerprint: String,
    original: u64,
    optimized: u64,
}

/// Persistent memo of compressor output, keyed by content and settings.
pub struct ImageCache {
    dir: Utf8PathBuf,
    compressor: Arc<dyn Compressor>,
}

impl ImageCache {
    pub fn new(dir: impl Into<Utf8PathBuf>, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            dir: dir.into(),
            compressor,
        }
    }

    pub fn get_or_compress(&self, kind: ImageKind, data: &[u8]) -> Result<Vec<u8>, StageError> {
        let fingerprint = self.compressor.fingerprint();
        let key = Hash32::hash_parts([data, fingerprint.as_bytes()]).to_hex();

        let path = self.dir.join(format!("{key}.{}", kind.extension()));
        let meta = self.dir.join(format!("{key}.meta.cbor"));

        if let Ok(bytes) = fs::read(&path) {
            if let Ok(file) = File::open(&meta)
                && let Ok(meta) = ciborium::from_reader::<CacheMeta, _>(BufReader::new(file))
            {
                tracing::debug!(
                    "image cache hit {key} ({} -> {} bytes)",
                    meta.original,
                    meta.optimized
                );
            }
            return Ok(bytes);
        }

        let out = self.compressor.compress(kind, data)?;

        fs::create_dir_all(&self.dir)?;

        let record = CacheMeta {
            fingerprint,
            original: data.len() as u64,
            optimized: out.len() as u64,
        };
        let mut encoded = Vec::new();
        ciborium::into_writer(&record, &mut encoded).map_err(std::io::Error::other)?;

        // The payload lands last, it is what marks an entry as present.
        write_atomic(&meta, &encoded)?;
        write_atomic(&path, &out)?;

        Ok(out)
    }
}

/// Write through a uniquely named temporary file and rename it into place,
/// so concurrent writers of the same entry never expose a torn file.
fn write_atomic(path: &Utf8Path, data: &[u8]) -> std::io::Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = Utf8PathBuf::from(format!("{path}.{}.{n}.tmp", std::process::id()));

    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

/// Optimises every known image type through an [`ImageCache`]; other files
/// pass through untouched.
pub struct Optimize {
    cache: Arc<ImageCache>,
}

impl Optimize {
    pub fn new(cache: Arc<ImageCache>) -> Self {
        Self { cache }
    }
}

impl Stage for Optimize {
    fn name(&self) -> &str {
        "imagemin"
    }

    fn apply(&self, _: &Environment, asset: Asset) -> Result<Vec<Asset>, StageError> {
        let Some(kind) = ImageKind::from_path(&asset.path) else {
            return Ok(vec![asset]);
        };

        let data = self.cache.get_or_compress(kind, &asset.data)?;

        Ok(vec![asset.with_data(data)])
    }
}
