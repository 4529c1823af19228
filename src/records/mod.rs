//! Record files hold serialized training samples, many per file. One frame is
//! `u32 LE meta_len | serde_json SampleMeta | u32 LE image_len | encoded image
//! bytes`; the image bytes stay exactly as encoded (jpeg or png), the metadata
//! carries every other field and defaults the missing ones.

pub mod builder;

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Flat coordinate slots per instance: 4 points, 2 coordinates each.
pub const BBOX_SIZE: usize = 8;
pub const RECORD_EXTENSION: &str = "rec";

const JPEG_MAGIC: [u8; 3] = [0xff, 0xd8, 0xff];
const PNG_MAGIC: [u8; 4] = [0x89, 0x50, 0x4e, 0x47];

// a section length beyond this is corruption, not data
const MAX_FRAME_LEN: usize = 64 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMeta {
    #[serde(default)]
    pub filename: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub boxes: Vec<f32>,
}

fn default_format() -> String {
    String::from("jpeg")
}

impl Default for SampleMeta {
    fn default() -> Self {
        Self {
            filename: String::new(),
            format: default_format(),
            height: 0,
            width: 0,
            tags: String::new(),
            count: 0,
            boxes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Record {
    pub meta: SampleMeta,
    pub image: Vec<u8>,
}

/// One decoded training example. `width` and `height` mirror the decoded
/// raster, not the stored metadata; polygon coordinates stay normalized to
/// [0, 1] and are scaled by those dimensions at synthesis time.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: RgbImage,
    pub width: u32,
    pub height: u32,
    pub filename: String,
    pub bboxes: Vec<Vec<[f32; 2]>>,
    pub tags: String,
}

pub fn decode_record(record: &Record) -> Result<Sample> {
    let image = decode_image(&record.image)
        .with_context(|| format!("couldn't decode image of record {:?}", record.meta.filename))?;
    let (width, height) = image.dimensions();
    Ok(Sample {
        image,
        width,
        height,
        filename: record.meta.filename.clone(),
        bboxes: reshape_boxes(&record.meta.boxes, record.meta.count),
        tags: record.meta.tags.clone(),
    })
}

/// The actual format comes from the leading magic bytes; the stored format
/// field is producer-asserted and not trusted. Empty byte buffers decode to
/// an empty raster so the validity filter can drop the sample downstream.
fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Ok(RgbImage::new(0, 0));
    }
    let format = if bytes.starts_with(&JPEG_MAGIC) {
        ImageFormat::Jpeg
    } else if bytes.starts_with(&PNG_MAGIC) {
        ImageFormat::Png
    } else {
        return Err(anyhow!(
            "unsupported image encoding, expected a jpeg or png signature"
        ));
    };
    Ok(image::load_from_memory_with_format(bytes, format)?.to_rgb8())
}

/// Reshapes the flat coordinate buffer into `count` polygons of 4 points,
/// clamping `count` when the buffer is short and stripping trailing zero
/// pairs, which are per-instance padding.
fn reshape_boxes(boxes: &[f32], count: usize) -> Vec<Vec<[f32; 2]>> {
    let count = count.min(boxes.len() / BBOX_SIZE);
    (0..count)
        .map(|i| {
            let mut points = boxes[i * BBOX_SIZE..(i + 1) * BBOX_SIZE]
                .chunks_exact(2)
                .map(|xy| [xy[0], xy[1]])
                .collect::<Vec<[f32; 2]>>();
            while points.last() == Some(&[0., 0.]) {
                points.pop();
            }
            points
        })
        .collect()
}

pub struct RecordReader {
    reader: BufReader<File>,
    path: PathBuf,
}

impl RecordReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("couldn't open record file {}", path.as_ref().display()))?;
        Ok(Self {
            reader: BufReader::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Reads the next frame, `None` at a clean end of file. Section lengths
    /// are checked against `MAX_FRAME_LEN` before any buffer is allocated.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let meta_len = match read_frame_len(&mut self.reader) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta_len > MAX_FRAME_LEN {
            return Err(anyhow!("oversized record frame in {}", self.path.display()));
        }
        let mut meta_buf = vec![0u8; meta_len];
        self.reader
            .read_exact(&mut meta_buf)
            .with_context(|| format!("truncated record frame in {}", self.path.display()))?;
        let meta: SampleMeta = serde_json::from_slice(&meta_buf)
            .with_context(|| format!("malformed record metadata in {}", self.path.display()))?;
        let image_len = read_frame_len(&mut self.reader)
            .with_context(|| format!("truncated record frame in {}", self.path.display()))?;
        if image_len > MAX_FRAME_LEN {
            return Err(anyhow!("oversized record frame in {}", self.path.display()));
        }
        let mut image = vec![0u8; image_len];
        self.reader
            .read_exact(&mut image)
            .with_context(|| format!("truncated record frame in {}", self.path.display()))?;
        Ok(Some(Record { meta, image }))
    }
}

fn read_frame_len<R: Read>(reader: &mut R) -> std::io::Result<usize> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf) as usize)
}

/// Reads every frame of a record file. A malformed trailing frame ends the
/// file early with a warning, keeping the records read before it.
pub fn read_records<P: AsRef<Path>>(path: P) -> Result<Vec<Record>> {
    let path = path.as_ref();
    let mut reader = RecordReader::open(path)?;
    let mut records = Vec::new();
    loop {
        match reader.next_record() {
            Ok(Some(record)) => records.push(record),
            Ok(None) => return Ok(records),
            Err(e) => {
                warn!(
                    "keeping {} readable records from {}: {:#}",
                    records.len(),
                    path.display(),
                    e
                );
                return Ok(records);
            }
        }
    }
}

pub struct RecordWriter {
    writer: BufWriter<File>,
}

impl RecordWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("couldn't create record file {}", path.as_ref().display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write_record(&mut self, meta: &SampleMeta, image: &[u8]) -> Result<()> {
        let meta_buf = serde_json::to_vec(meta)?;
        self.writer.write_all(&(meta_buf.len() as u32).to_le_bytes())?;
        self.writer.write_all(&meta_buf)?;
        self.writer.write_all(&(image.len() as u32).to_le_bytes())?;
        self.writer.write_all(image)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

pub fn list_record_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir.as_ref())
        .with_context(|| format!("couldn't open dataset dir {}", dir.as_ref().display()))?;
    let mut files = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION))
        .collect::<Vec<PathBuf>>();
    files.sort();
    Ok(files)
}

#[cfg(test)]
pub(crate) fn encode_test_png(width: u32, height: u32) -> Vec<u8> {
    use image::{DynamicImage, ImageOutputFormat, Rgb};
    let image = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .unwrap();
    bytes
}
