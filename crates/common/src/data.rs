//! Data pipeline: CIFAR-style image records, in-memory datasets, batching.
//!
//! Images are handed to the network as `(N, 32, 32, 3)` f32 tensors with
//! pixel values scaled to `[0, 1]`. No other preprocessing happens here.
//!
//! * **[`CifarDataset`]**: zero-copy access to CIFAR-10 binary batch files via `memmap2`.
//! * **[`InMemoryDataset`]**: owned pixels and labels (tests, synthetic smoke runs).
//! * **[`ImageDataset::batches`]**: optionally shuffled, seeded batching.

use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::DatasetError;

/// Spatial side of every image.
pub const IMAGE_SIZE: usize = 32;
/// Colour channels per image.
pub const IMAGE_CHANNELS: usize = 3;
/// Values per decoded image.
pub const PIXELS_PER_IMAGE: usize = IMAGE_SIZE * IMAGE_SIZE * IMAGE_CHANNELS;

// ── CIFAR binary format ─────────────────────────────────────────────────────

/// One record: label byte, then the R, G and B planes (32×32 bytes each, row-major).
pub const CIFAR_RECORD_LEN: usize = 1 + PIXELS_PER_IMAGE;
const PLANE_LEN: usize = IMAGE_SIZE * IMAGE_SIZE;

/// Decode one CIFAR record's pixel planes into HWC floats in `[0, 1]`.
fn decode_planes(planes: &[u8], out: &mut Vec<f32>) {
    out.reserve(PIXELS_PER_IMAGE);
    for y in 0..IMAGE_SIZE {
        for x in 0..IMAGE_SIZE {
            for c in 0..IMAGE_CHANNELS {
                let v = planes[c * PLANE_LEN + y * IMAGE_SIZE + x];
                out.push(v as f32 / 255.0);
            }
        }
    }
}

// ── ImageDataset trait ──────────────────────────────────────────────────────

/// A decoded mini-batch in NHWC order.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub pixels: Vec<f32>,
    pub labels: Vec<u32>,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Common interface for labelled 32×32×3 image collections.
pub trait ImageDataset {
    fn num_images(&self) -> usize;

    fn label(&self, index: usize) -> u32;

    /// Append image `index` (HWC, `[0, 1]`) to `out` and return its label.
    fn image_into(&self, index: usize, out: &mut Vec<f32>) -> u32;

    /// Yield batches of up to `batch_size` images. The final batch may be
    /// short. With a seed the visiting order is a reproducible permutation.
    fn batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Box<dyn Iterator<Item = ImageBatch> + '_> {
        let order = visit_order(self.num_images(), shuffle_seed);
        let batch_size = batch_size.max(1);
        let mut start = 0usize;
        Box::new(std::iter::from_fn(move || {
            if start >= order.len() {
                return None;
            }
            let end = (start + batch_size).min(order.len());
            let mut pixels = Vec::with_capacity((end - start) * PIXELS_PER_IMAGE);
            let mut labels = Vec::with_capacity(end - start);
            for &idx in &order[start..end] {
                labels.push(self.image_into(idx, &mut pixels));
            }
            start = end;
            Some(ImageBatch { pixels, labels })
        }))
    }
}

/// Identity order, or a seeded shuffle of it.
fn visit_order(n: usize, shuffle_seed: Option<u64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    if let Some(seed) = shuffle_seed {
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    order
}

/// Fail if any label is outside `0..class_num`.
pub fn check_labels(dataset: &dyn ImageDataset, class_num: usize) -> std::result::Result<(), DatasetError> {
    for i in 0..dataset.num_images() {
        let label = dataset.label(i);
        if label as usize >= class_num {
            return Err(DatasetError::LabelOutOfRange { label, class_num });
        }
    }
    Ok(())
}

// ── CifarDataset (mmap) ─────────────────────────────────────────────────────

/// Zero-copy dataset over one or more CIFAR-10 binary batch files.
///
/// Each file is memory-mapped; only the pages touched for each batch are
/// paged in.
pub struct CifarDataset {
    files: Vec<Mmap>,
    /// Cumulative record counts: `offsets[i]` is the first global index of file `i`.
    offsets: Vec<usize>,
    num_images: usize,
}

impl CifarDataset {
    /// Open a single `.bin` file or every `.bin` file in a directory (sorted).
    pub fn open(path: &Path) -> std::result::Result<Self, DatasetError> {
        let paths = collect_files(path)?;
        if paths.is_empty() {
            return Err(DatasetError::Empty(path.to_path_buf()));
        }

        let mut files = Vec::with_capacity(paths.len());
        let mut offsets = Vec::with_capacity(paths.len());
        let mut num_images = 0usize;
        for p in paths {
            let io_err = |source| DatasetError::Io {
                path: p.clone(),
                source,
            };
            let file = File::open(&p).map_err(io_err)?;
            let mmap = unsafe { Mmap::map(&file).map_err(io_err)? };
            if mmap.len() % CIFAR_RECORD_LEN != 0 {
                return Err(DatasetError::Truncated {
                    path: p,
                    len: mmap.len(),
                    record_len: CIFAR_RECORD_LEN,
                });
            }
            offsets.push(num_images);
            num_images += mmap.len() / CIFAR_RECORD_LEN;
            files.push(mmap);
        }

        Ok(Self {
            files,
            offsets,
            num_images,
        })
    }

    /// Raw record bytes for global index `index`.
    fn record(&self, index: usize) -> &[u8] {
        let file_idx = self.offsets.partition_point(|&o| o <= index) - 1;
        let local = index - self.offsets[file_idx];
        let start = local * CIFAR_RECORD_LEN;
        &self.files[file_idx][start..start + CIFAR_RECORD_LEN]
    }
}

impl ImageDataset for CifarDataset {
    fn num_images(&self) -> usize {
        self.num_images
    }

    fn label(&self, index: usize) -> u32 {
        self.record(index)[0] as u32
    }

    fn image_into(&self, index: usize, out: &mut Vec<f32>) -> u32 {
        let rec = self.record(index);
        decode_planes(&rec[1..], out);
        rec[0] as u32
    }
}

// ── InMemoryDataset ─────────────────────────────────────────────────────────

/// Owned images, already decoded to HWC floats.
pub struct InMemoryDataset {
    pixels: Vec<f32>,
    labels: Vec<u32>,
}

impl InMemoryDataset {
    pub fn new(pixels: Vec<f32>, labels: Vec<u32>) -> std::result::Result<Self, DatasetError> {
        let expected = labels.len() * PIXELS_PER_IMAGE;
        if pixels.len() != expected {
            return Err(DatasetError::PixelCount {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { pixels, labels })
    }

    /// Uniform-noise images with random labels, for smoke runs.
    pub fn synthetic(num_images: usize, class_num: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let pixels = (0..num_images * PIXELS_PER_IMAGE)
            .map(|_| rng.gen::<f32>())
            .collect();
        let labels = (0..num_images)
            .map(|_| rng.gen_range(0..class_num.max(1)) as u32)
            .collect();
        Self { pixels, labels }
    }
}

impl ImageDataset for InMemoryDataset {
    fn num_images(&self) -> usize {
        self.labels.len()
    }

    fn label(&self, index: usize) -> u32 {
        self.labels[index]
    }

    fn image_into(&self, index: usize, out: &mut Vec<f32>) -> u32 {
        let start = index * PIXELS_PER_IMAGE;
        out.extend_from_slice(&self.pixels[start..start + PIXELS_PER_IMAGE]);
        self.labels[index]
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a decoded batch to `(images (N, 32, 32, 3) f32, labels (N,) u32)`.
pub fn batch_to_tensors(batch: &ImageBatch, device: &Device) -> Result<(Tensor, Tensor)> {
    let n = batch.len();
    let images = Tensor::from_slice(
        &batch.pixels,
        (n, IMAGE_SIZE, IMAGE_SIZE, IMAGE_CHANNELS),
        device,
    )?;
    let labels = Tensor::from_slice(&batch.labels, (n,), device)?;
    Ok((images, labels))
}

/// Collect `.bin` files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> std::result::Result<Vec<PathBuf>, DatasetError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "bin").unwrap_or(false))
        .collect();
    out.sort();
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────
