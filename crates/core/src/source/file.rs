use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{Frame, FrameClock, FrameSource, PixelFormat};
use crate::error::CaptureError;

/// Reads headerless raw frames (`frame_size` bytes each) from a file.
///
/// With looping enabled the file is rewound at end of data and presentation
/// times keep advancing, so downstream timing never jumps backwards. A
/// trailing partial frame is ignored.
pub struct RawFileSource {
    path: PathBuf,
    reader: BufReader<File>,
    width: u32,
    height: u32,
    format: PixelFormat,
    fps: u32,
    frame_size: usize,
    clock: FrameClock,
    looping: bool,
    exhausted: bool,
}

impl RawFileSource {
    pub fn open(
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: u32,
    ) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidGeometry { width, height });
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let frame_size = format.frame_size(width, height);

        tracing::info!(
            path = %path.display(),
            width,
            height,
            %format,
            frame_size,
            "raw file source opened"
        );

        Ok(Self {
            path,
            reader: BufReader::new(file),
            width,
            height,
            format,
            fps,
            frame_size,
            clock: FrameClock::new(fps)?,
            looping: false,
            exhausted: false,
        })
    }

    /// Rewind and replay when the end of the file is reached.
    pub fn looping(mut self, enabled: bool) -> Self {
        self.looping = enabled;
        self
    }

    /// Fill `buf` completely. `Ok(false)` on clean or partial end of data.
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    if filled > 0 {
                        tracing::debug!(
                            path = %self.path.display(),
                            bytes = filled,
                            "ignoring trailing partial frame"
                        );
                    }
                    return Ok(false);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl FrameSource for RawFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut data = vec![0u8; self.frame_size];
        if !self.read_frame(&mut data)? {
            if !self.looping {
                self.exhausted = true;
                return Ok(None);
            }
            self.reader.seek(SeekFrom::Start(0))?;
            tracing::debug!(path = %self.path.display(), "raw file source rewound");
            if !self.read_frame(&mut data)? {
                // shorter than a single frame
                self.exhausted = true;
                return Ok(None);
            }
        }

        let (index, pts) = self.clock.tick();
        Ok(Some(Frame {
            data,
            width: self.width,
            height: self.height,
            format: self.format,
            pts,
            captured_at: Instant::now(),
            index,
        }))
    }

    fn frame_rate(&self) -> u32 {
        self.fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "rtpstream-{}-{}-{name}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn reads_whole_frames_and_ignores_tail() {
        // two 2x2 gray frames plus 3 stray bytes
        let path = temp_file("tail", &[1, 1, 1, 1, 2, 2, 2, 2, 9, 9, 9]);
        let mut src = RawFileSource::open(&path, 2, 2, PixelFormat::Gray8, 1000).unwrap();

        assert_eq!(src.next_frame().unwrap().unwrap().data, vec![1; 4]);
        assert_eq!(src.next_frame().unwrap().unwrap().data, vec![2; 4]);
        assert!(src.next_frame().unwrap().is_none());
        assert!(src.next_frame().unwrap().is_none());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn looping_rewinds_with_advancing_pts() {
        let path = temp_file("loop", &[7, 7, 7, 7]);
        let mut src = RawFileSource::open(&path, 2, 2, PixelFormat::Gray8, 1000)
            .unwrap()
            .looping(true);

        let a = src.next_frame().unwrap().unwrap();
        let b = src.next_frame().unwrap().unwrap();
        assert_eq!(a.data, b.data);
        assert!(b.pts > a.pts);
        assert_eq!(b.index, 1);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn looping_file_shorter_than_frame_ends() {
        let path = temp_file("short", &[1, 2]);
        let mut src = RawFileSource::open(&path, 2, 2, PixelFormat::Gray8, 1000)
            .unwrap()
            .looping(true);
        assert!(src.next_frame().unwrap().is_none());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_is_capture_error() {
        let err = RawFileSource::open(
            "/nonexistent/rtpstream/frames.yuv",
            2,
            2,
            PixelFormat::Gray8,
            30,
        )
        .err()
        .unwrap();
        assert!(matches!(err, CaptureError::Io(_)));
    }
}
