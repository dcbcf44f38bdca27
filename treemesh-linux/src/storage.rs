//! File-backed firmware collaborators: image directory, download sink and state record.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use treemesh_core::firmware::{image_file_name, parse_image_file_name};
use treemesh_core::integrity::{matches_md5, FirmwareHasher};
use treemesh_core::{
    FirmwareError, FirmwareImage, FirmwareRecord, FirmwareSink, FirmwareWriter, ImageLibrary,
    StateStore,
};

/// Every `firmware_<hardware>_<role>.bin` in `dir`, sliced into `part_size` parts.
pub fn load_library(dir: &Path, part_size: usize) -> std::io::Result<ImageLibrary> {
    let mut lib = ImageLibrary::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some((hardware, role)) = name.to_str().and_then(parse_image_file_name) else {
            continue;
        };
        let bytes = fs::read(entry.path())?;
        if bytes.is_empty() {
            warn!(path = %entry.path().display(), "empty firmware image skipped");
            continue;
        }
        let image = FirmwareImage::new(&hardware, &role, bytes, part_size);
        info!(%hardware, %role, md5 = %image.id().md5, parts = image.no_part(), "firmware image loaded");
        lib.insert(image);
    }
    Ok(lib)
}

/// Writes incoming images to `<dir>/firmware_<hardware>_<role>.bin` via a temp file.
pub struct FileSink {
    dir: PathBuf,
    hardware: String,
    role: String,
}

impl FileSink {
    pub fn new(dir: PathBuf, hardware: &str, role: &str) -> Self {
        Self {
            dir,
            hardware: hardware.to_string(),
            role: role.to_string(),
        }
    }
}

impl FirmwareSink for FileSink {
    fn begin_write(&mut self, size_hint: u64) -> Result<Box<dyn FirmwareWriter>, FirmwareError> {
        fs::create_dir_all(&self.dir)?;
        let dest = self.dir.join(image_file_name(&self.hardware, &self.role));
        let tmp = dest.with_extension("part");
        let file = File::create(&tmp).map_err(|e| FirmwareError::Begin(e.to_string()))?;
        debug!(path = %tmp.display(), size_hint, "firmware download started");
        Ok(Box::new(FileWriter {
            file: Some(file),
            tmp,
            dest,
            hasher: FirmwareHasher::new(),
            done: false,
        }))
    }
}

struct FileWriter {
    file: Option<File>,
    tmp: PathBuf,
    dest: PathBuf,
    hasher: FirmwareHasher,
    done: bool,
}

impl FirmwareWriter for FileWriter {
    fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), FirmwareError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| FirmwareError::Write("writer closed".into()))?;
        file.write_all(bytes)
            .map_err(|e| FirmwareError::Write(e.to_string()))?;
        self.hasher.update(bytes);
        Ok(())
    }

    fn finalize(mut self: Box<Self>, expected_md5: &str) -> Result<(), FirmwareError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| FirmwareError::Finalize("writer closed".into()))?;
        file.sync_all()
            .map_err(|e| FirmwareError::Finalize(e.to_string()))?;
        drop(file);
        let actual = std::mem::take(&mut self.hasher).finish_hex();
        if !matches_md5(&actual, expected_md5) {
            return Err(FirmwareError::HashMismatch {
                expected: expected_md5.to_string(),
                actual,
            });
        }
        fs::rename(&self.tmp, &self.dest)
            .map_err(|e| FirmwareError::Finalize(e.to_string()))?;
        self.done = true;
        info!(path = %self.dest.display(), md5 = %actual, "firmware image written");
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.file.take();
        if let Err(e) = fs::remove_file(&self.tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.tmp.display(), error = %e, "cannot remove partial image");
            }
        }
    }
}

/// JSON file holding the committed [`FirmwareRecord`].
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<Option<FirmwareRecord>, FirmwareError> {
        match fs::read_to_string(&self.path) {
            Ok(s) => FirmwareRecord::from_json(&s).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, record: &FirmwareRecord) -> Result<(), FirmwareError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, record.to_json()?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
