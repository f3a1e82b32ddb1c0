// frame sources feeding the analysis worker
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::preprocess::{Frame, Yuv420Frame};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "webp", "tiff"];
const RAW_EXTENSIONS: [&str; 2] = ["yuv", "i420"];

pub trait FrameSource {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }
}

/// Replays still images (for example a camera frame dump) in file name order.
#[derive(Debug, Clone)]
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    position: usize,
}

impl ImageDirSource {
    /// Collects image files from `inputs`; directories are scanned one level deep.
    pub fn open<P: AsRef<Path>>(inputs: &[P]) -> Result<Self> {
        let mut paths = Vec::new();

        for input in inputs {
            let input = input.as_ref();
            if input.is_dir() {
                let mut entries: Vec<PathBuf> = std::fs::read_dir(input)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && is_image(p))
                    .collect();
                entries.sort();
                paths.extend(entries);
            } else if is_image(input) {
                paths.push(input.to_path_buf());
            } else {
                warn!(path = %input.display(), "skipping non-image input");
            }
        }

        debug!(frames = paths.len(), "opened image source");
        Ok(Self { paths, position: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;

        let image = image::open(path)?.to_rgb8();
        debug!(path = %path.display(), width = image.width(), height = image.height(), "read frame");
        Ok(Some(Frame::Rgb(image)))
    }
}

/// Replays raw camera dumps in I420 layout: every file holds back-to-back frames, each a
/// full-size Y plane followed by the half-size U and V planes.
#[derive(Debug)]
pub struct RawYuvSource {
    width: u32,
    height: u32,
    files: Vec<(PathBuf, usize)>,
    next_file: usize,
    reader: Option<BufReader<File>>,
    remaining: usize,
}

impl RawYuvSource {
    /// Collects dump files from `inputs`; directories are scanned one level deep for
    /// `.yuv` and `.i420` files. Trailing bytes that do not fill a frame are ignored.
    pub fn open<P: AsRef<Path>>(inputs: &[P], width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Config(format!(
                "raw frame size {width}x{height} must be non-zero"
            )));
        }
        let frame_len = i420_len(width, height) as u64;

        let mut paths = Vec::new();
        for input in inputs {
            let input = input.as_ref();
            if input.is_dir() {
                let mut entries: Vec<PathBuf> = std::fs::read_dir(input)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && has_extension(p, &RAW_EXTENSIONS))
                    .collect();
                entries.sort();
                paths.extend(entries);
            } else {
                paths.push(input.to_path_buf());
            }
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let len = std::fs::metadata(&path)?.len();
            if len % frame_len != 0 {
                warn!(
                    path = %path.display(),
                    trailing = len % frame_len,
                    "ignoring bytes after the last whole frame"
                );
            }
            files.push((path, (len / frame_len) as usize));
        }

        debug!(frames = files.iter().map(|(_, n)| n).sum::<usize>(), "opened raw source");
        Ok(Self {
            width,
            height,
            files,
            next_file: 0,
            reader: None,
            remaining: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.iter().map(|(_, frames)| frames).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let (w, h) = (self.width as usize, self.height as usize);
        let chroma = ((w + 1) / 2) * ((h + 1) / 2);
        let mut y = vec![0u8; w * h];
        let mut u = vec![0u8; chroma];
        let mut v = vec![0u8; chroma];
        reader.read_exact(&mut y)?;
        reader.read_exact(&mut u)?;
        reader.read_exact(&mut v)?;
        self.remaining -= 1;

        Ok(Some(Frame::Yuv420(Yuv420Frame {
            width: self.width,
            height: self.height,
            y,
            u,
            v,
            y_row_stride: w,
            uv_row_stride: (w + 1) / 2,
            uv_pixel_stride: 1,
        })))
    }
}

impl FrameSource for RawYuvSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        while self.remaining == 0 {
            let Some((path, frames)) = self.files.get(self.next_file) else {
                self.reader = None;
                return Ok(None);
            };
            self.next_file += 1;
            self.remaining = *frames;
            self.reader = Some(BufReader::new(File::open(path)?));
            debug!(path = %path.display(), frames, "reading raw frames");
        }
        self.read_frame()
    }
}

fn i420_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    w * h + 2 * ((w + 1) / 2) * ((h + 1) / 2)
}

fn is_image(path: &Path) -> bool {
    has_extension(path, &IMAGE_EXTENSIONS)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
