//! video — frame type and the frame-source interface
//!
//! Container decoding lives outside this crate. Hosts hand frames in through
//! [`FrameSource`]; the bundled [`ImageSequence`] reads a directory of still
//! images so the pipeline can run without any codec stack.

use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Frame rate assumed when a source cannot report one.
pub const DEFAULT_FPS: f64 = 30.0;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// A single video frame in RGB24 format, along with its presentation index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// Wrap an owned image buffer.
    pub fn from_image(img: RgbImage, pts: i64) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: img.into_raw(),
            width,
            height,
            pts,
        }
    }

    /// Copy the frame into an `image` buffer.
    pub fn to_image(&self) -> RgbImage {
        // Length is width * height * 3 by construction of every RgbFrame in
        // this crate; fall back to a blank canvas for hand-built frames.
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// Consume the frame into an `image` buffer without copying.
    pub fn into_image(self) -> RgbImage {
        let (w, h) = (self.width, self.height);
        RgbImage::from_raw(w, h, self.data).unwrap_or_else(|| RgbImage::new(w, h))
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Stream metadata reported by a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMeta {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
}

/// Random-access frame retrieval. Implemented by the host's decoder.
pub trait FrameSource {
    fn meta(&self) -> VideoMeta;

    /// Fetch frame `index`, or `None` past the end of the stream.
    fn frame_at(&mut self, index: u64) -> Result<Option<RgbFrame>>;

    /// Sequential iteration starting at `start`. Stops at the first missing
    /// frame; read errors are yielded once and end the iteration.
    fn frames_from(&mut self, start: u64) -> Frames<'_, Self>
    where
        Self: Sized,
    {
        Frames {
            source: self,
            next: start,
            done: false,
        }
    }
}

pub struct Frames<'a, S: FrameSource> {
    source: &'a mut S,
    next: u64,
    done: bool,
}

impl<S: FrameSource> Iterator for Frames<'_, S> {
    type Item = Result<(u64, RgbFrame)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let index = self.next;
        match self.source.frame_at(index) {
            Ok(Some(frame)) => {
                self.next += 1;
                Some(Ok((index, frame)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ── Image sequence ───────────────────────────────────────────────────────────

/// A directory of still images treated as consecutive frames, ordered by
/// file name.
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    meta: VideoMeta,
}

impl ImageSequence {
    pub fn open<P: AsRef<Path>>(dir: P, fps: f64) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("could not read frame directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        paths.sort();

        let Some(first) = paths.first() else {
            bail!("no image frames found in {}", dir.display());
        };
        let (width, height) = image::image_dimensions(first)
            .with_context(|| format!("could not read first frame {}", first.display()))?;

        let fps = if fps.is_finite() && fps > 0.0 {
            fps
        } else {
            DEFAULT_FPS
        };
        let meta = VideoMeta {
            width,
            height,
            fps,
            frame_count: paths.len() as u64,
        };
        info!(
            dir = %dir.display(),
            width,
            height,
            frames = meta.frame_count,
            "opened image sequence"
        );
        Ok(Self { paths, meta })
    }
}

impl FrameSource for ImageSequence {
    fn meta(&self) -> VideoMeta {
        self.meta
    }

    fn frame_at(&mut self, index: u64) -> Result<Option<RgbFrame>> {
        let Some(path) = usize::try_from(index).ok().and_then(|i| self.paths.get(i)) else {
            return Ok(None);
        };
        let img = image::open(path)
            .with_context(|| format!("failed to decode frame {}", path.display()))?
            .into_rgb8();
        debug!(index, path = %path.display(), "loaded frame");
        Ok(Some(RgbFrame::from_image(img, index as i64)))
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Writes frames as `frame_000000.png`, `frame_000001.png`, ...
pub struct ImageSequenceWriter {
    dir: PathBuf,
    written: u64,
}

impl ImageSequenceWriter {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("could not create output directory {}", dir.display()))?;
        Ok(Self { dir, written: 0 })
    }

    pub fn write(&mut self, frame: &RgbFrame) -> Result<PathBuf> {
        let path = self.dir.join(format!("frame_{:06}.png", self.written));
        frame
            .to_image()
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.written += 1;
        Ok(path)
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn frame_image_round_trip_keeps_pixels() {
        let mut img = RgbImage::new(4, 3);
        img.put_pixel(2, 1, Rgb([10, 20, 30]));
        let frame = RgbFrame::from_image(img.clone(), 7);
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 3);
        assert_eq!(frame.pts, 7);
        assert_eq!(frame.to_image(), img);
    }

    #[test]
    fn sequence_reads_sorted_frames_and_stops_at_end() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 200u8), ("a.png", 100u8)] {
            RgbImage::from_pixel(8, 6, Rgb([shade, shade, shade]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut seq = ImageSequence::open(dir.path(), 0.0).unwrap();
        let meta = seq.meta();
        assert_eq!(meta.frame_count, 2);
        assert_eq!((meta.width, meta.height), (8, 6));
        assert_eq!(meta.fps, DEFAULT_FPS);

        let frames: Vec<_> = seq.frames_from(0).collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1.data[0], 100);
        assert_eq!(frames[1].1.data[0], 200);
        assert!(seq.frame_at(2).unwrap().is_none());
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageSequence::open(dir.path(), 25.0).is_err());
    }
}
