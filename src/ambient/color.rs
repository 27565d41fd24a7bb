//! Ambient color extraction from media files.
//!
//! - Images and the first frame of gifs are decoded with the image crate
//! - The color is a per-channel mean over a sparse 10x10 sample grid
//! - Results (including "no color") are memoized in an LRU keyed by xxhash of
//!   (cache version, path, file version)

use std::num::NonZeroUsize;
use std::path::Path;

use image::{DynamicImage, GenericImageView};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use super::Rgb;
use crate::models::{MediaItem, MediaType};

/// Samples per image dimension.
const SAMPLES_PER_DIMENSION: u32 = 10;

/// Bump when sampling semantics change.
const COLOR_CACHE_VERSION: u8 = 1;

const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Computes the ambient color of a media item.
pub trait MediaProbe: Send + Sync + 'static {
    fn average_color(&self, item: &MediaItem) -> Option<Rgb>;
}

/// [`MediaProbe`] for still images and gifs.
pub struct ImageProbe {
    cache: Mutex<LruCache<u64, Option<Rgb>>>,
}

impl ImageProbe {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn decode(path: &Path) -> Option<DynamicImage> {
        match image::open(path) {
            Ok(img) => Some(img),
            Err(e) => {
                debug!(?path, error = %e, "Failed to decode image for ambient color");
                None
            }
        }
    }
}

impl Default for ImageProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaProbe for ImageProbe {
    fn average_color(&self, item: &MediaItem) -> Option<Rgb> {
        if !matches!(item.media_type, MediaType::Image | MediaType::Gif) {
            return None;
        }

        let key = cache_key(&item.path, item.version);
        if let Some(cached) = self.cache.lock().get(&key) {
            trace!(path = ?item.path, "Ambient color cache hit");
            return *cached;
        }

        // Decode outside the lock; a racing duplicate decode is harmless.
        let color = Self::decode(&item.path).and_then(|img| sparse_average(&img));
        self.cache.lock().put(key, color);
        color
    }
}

fn cache_key(path: &Path, version: i64) -> u64 {
    let path_str = path.to_string_lossy();
    let mut data = Vec::with_capacity(path_str.len() + 9);
    data.push(COLOR_CACHE_VERSION);
    data.extend_from_slice(path_str.as_bytes());
    data.extend_from_slice(&version.to_le_bytes());
    xxh3_64(&data)
}

/// Mean color over a grid of about 10x10 evenly spaced pixels.
pub fn sparse_average(img: &DynamicImage) -> Option<Rgb> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let step_x = (width / SAMPLES_PER_DIMENSION).max(1) as usize;
    let step_y = (height / SAMPLES_PER_DIMENSION).max(1) as usize;

    let (mut r, mut g, mut b, mut count) = (0u64, 0u64, 0u64, 0u64);
    for x in (0..width).step_by(step_x) {
        for y in (0..height).step_by(step_y) {
            let pixel = img.get_pixel(x, y);
            r += u64::from(pixel[0]);
            g += u64::from(pixel[1]);
            b += u64::from(pixel[2]);
            count += 1;
        }
    }

    let mean = |sum: u64| ((sum + count / 2) / count) as u8;
    Some(Rgb::new(mean(r), mean(g), mean(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, RgbImage};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_uniform_image() {
        let img = RgbImage::from_pixel(40, 30, image::Rgb([10, 200, 30]));
        assert_eq!(
            sparse_average(&DynamicImage::ImageRgb8(img)),
            Some(Rgb::new(10, 200, 30))
        );
    }

    #[test]
    fn test_half_split_image() {
        // Left half black, right half white: samples split evenly.
        let img: RgbImage = ImageBuffer::from_fn(100, 10, |x, _| {
            if x < 50 {
                image::Rgb([0, 0, 0])
            } else {
                image::Rgb([200, 100, 50])
            }
        });
        assert_eq!(
            sparse_average(&DynamicImage::ImageRgb8(img)),
            Some(Rgb::new(100, 50, 25))
        );
    }

    #[test]
    fn test_tiny_image() {
        let img = RgbImage::from_pixel(1, 1, image::Rgb([1, 2, 3]));
        assert_eq!(
            sparse_average(&DynamicImage::ImageRgb8(img)),
            Some(Rgb::new(1, 2, 3))
        );
    }

    #[test]
    fn test_probe_reads_file_and_memoizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(20, 20, image::Rgb([255, 0, 0]))
            .save(&path)
            .unwrap();

        let probe = ImageProbe::new();
        let item = MediaItem::new(path.clone(), MediaType::Image, 1);
        assert_eq!(probe.average_color(&item), Some(Rgb::new(255, 0, 0)));

        fs::remove_file(&path).unwrap();
        assert_eq!(probe.average_color(&item), Some(Rgb::new(255, 0, 0)));

        // A new version misses the cache.
        let rewritten = MediaItem::new(path, MediaType::Image, 2);
        assert_eq!(probe.average_color(&rewritten), None);
    }

    #[test]
    fn test_non_images_have_no_color() {
        let probe = ImageProbe::new();
        assert_eq!(probe.average_color(&MediaItem::none()), None);
        assert_eq!(probe.average_color(&MediaItem::loading()), None);
        let video = MediaItem::new("/a/clip.mp4".into(), MediaType::Video, 1);
        assert_eq!(probe.average_color(&video), None);
    }
}
