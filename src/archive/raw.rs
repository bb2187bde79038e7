// Raw reference archive writer
//
// Frames are written back to back (video, then each audio pair) with a JSON
// sidecar describing the layout and session results. In paged mode the
// essence is split over numbered page files instead of one file.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{ArchiveError, ArchiveFormat, ArchiveWriter, ArchiveWriterFactory, Completion, ContentPackage, Result};

/// Creates [`RawArchiveWriter`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RawArchiveWriterFactory;

impl ArchiveWriterFactory for RawArchiveWriterFactory {
    fn create(&self, path: &Path, format: &ArchiveFormat) -> Result<Box<dyn ArchiveWriter>> {
        Ok(Box::new(RawArchiveWriter::create(path, format.clone())?))
    }
}

/// `<base>.<suffix>`, keeping the base's own extension
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of page `index` in paged mode
pub fn page_path(base: &Path, index: usize) -> PathBuf {
    with_suffix(base, &format!("p{:03}", index))
}

/// Path of the JSON sidecar written on completion
pub fn sidecar_path(base: &Path) -> PathBuf {
    with_suffix(base, "json")
}

#[derive(Serialize)]
struct Sidecar<'a> {
    format: &'a ArchiveFormat,
    frame_size: u64,
    files: Vec<String>,
    completed_at: String,
    #[serde(flatten)]
    completion: &'a Completion<'a>,
}

pub struct RawArchiveWriter {
    base: PathBuf,
    format: ArchiveFormat,
    frame_size: u64,
    writer: Option<BufWriter<File>>,
    files: Vec<PathBuf>,
    page_bytes: u64,
    bytes_written: u64,
}

impl RawArchiveWriter {
    pub fn create(path: &Path, format: ArchiveFormat) -> Result<Self> {
        let video = &format.video;
        let frame_size = video.video_size() as u64 + video.audio_pairs as u64 * video.audio_pair_size() as u64;

        let mut writer = Self {
            base: path.to_path_buf(),
            format,
            frame_size,
            writer: None,
            files: Vec::new(),
            page_bytes: 0,
            bytes_written: 0,
        };
        writer.open_next_file()?;

        log::info!(
            "Raw archive opened at {} ({} bytes per frame{})",
            path.display(),
            frame_size,
            match writer.format.page_size {
                Some(size) => format!(", {} byte pages", size),
                None => String::new(),
            }
        );
        Ok(writer)
    }

    fn open_next_file(&mut self) -> Result<()> {
        if let Some(mut current) = self.writer.take() {
            current.flush()?;
        }

        let path = match self.format.page_size {
            Some(_) => page_path(&self.base, self.files.len()),
            None => self.base.clone(),
        };
        let file = File::create(&path).map_err(|source| ArchiveError::Create {
            path: path.clone(),
            source,
        })?;

        self.files.push(path);
        self.writer = Some(BufWriter::new(file));
        self.page_bytes = 0;
        Ok(())
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl ArchiveWriter for RawArchiveWriter {
    fn write_frame(&mut self, package: &ContentPackage<'_>) -> Result<()> {
        if let Some(page_size) = self.format.page_size {
            if self.page_bytes > 0 && self.page_bytes + self.frame_size > page_size {
                self.open_next_file()?;
            }
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ArchiveError::Write("archive already closed".into()))?;
        writer.write_all(package.video)?;
        for pair in package.audio {
            writer.write_all(pair)?;
        }

        self.page_bytes += self.frame_size;
        self.bytes_written += self.frame_size;
        Ok(())
    }

    fn complete(mut self: Box<Self>, completion: &Completion<'_>) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| ArchiveError::Complete(format!("flush failed: {}", e)))?;
        }

        let sidecar = Sidecar {
            format: &self.format,
            frame_size: self.frame_size,
            files: self.files.iter().map(|p| p.display().to_string()).collect(),
            completed_at: chrono::Local::now().to_rfc3339(),
            completion,
        };
        let json = serde_json::to_string_pretty(&sidecar)?;
        let path = sidecar_path(&self.base);
        std::fs::write(&path, json)
            .map_err(|e| ArchiveError::Complete(format!("{}: {}", path.display(), e)))?;

        log::info!(
            "Raw archive completed: {} frames, {} bytes in {} file(s)",
            completion.frames,
            self.bytes_written,
            self.files.len()
        );
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.writer.take();

        let mut first_error = None;
        for path in &self.files {
            if let Err(e) = std::fs::remove_file(path) {
                log::warn!("Failed to remove {}: {}", path.display(), e);
                first_error.get_or_insert(e);
            }
        }
        log::info!("Raw archive aborted, removed {} file(s)", self.files.len());

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
