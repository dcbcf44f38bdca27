//! Firmware collaborators: the sink that flashes an incoming image, the source that slices
//! outgoing images, and the persisted record of what is running.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::NodeId;
use crate::integrity;
use crate::protocol::{Announce, FirmwareId};

/// Part size used when an image is loaded with size 0.
pub const DEFAULT_PART_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("cannot begin firmware write: {0}")]
    Begin(String),
    #[error("firmware write failed: {0}")]
    Write(String),
    #[error("firmware finalize failed: {0}")]
    Finalize(String),
    #[error("firmware hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("firmware state store: {0}")]
    Store(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One in-flight write. Dropping it without `finalize` aborts the write.
pub trait FirmwareWriter: Send {
    fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), FirmwareError>;
    /// Flush, verify against `expected_md5` and make the image bootable.
    fn finalize(self: Box<Self>, expected_md5: &str) -> Result<(), FirmwareError>;
}

pub trait FirmwareSink: Send {
    fn begin_write(&mut self, size_hint: u64) -> Result<Box<dyn FirmwareWriter>, FirmwareError>;
}

/// Distributor side: bytes of one part, empty if not available (yet).
pub trait FirmwareSource: Send {
    fn chunk_at(&self, firmware: &FirmwareId, part_no: u32) -> Vec<u8>;

    /// Builds to announce periodically.
    fn announcements(&self) -> Vec<(FirmwareId, u32)> {
        Vec::new()
    }
}

/// Where the running-firmware record lives between boots.
pub trait StateStore: Send {
    fn load(&self) -> Result<Option<FirmwareRecord>, FirmwareError>;
    fn save(&mut self, record: &FirmwareRecord) -> Result<(), FirmwareError>;
}

/// Persisted record of the committed firmware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRecord {
    #[serde(default)]
    pub md5: String,
    #[serde(default)]
    pub hardware: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub broadcasted: bool,
}

impl FirmwareRecord {
    pub fn new(hardware: &str, role: &str) -> Self {
        Self {
            hardware: hardware.to_string(),
            role: role.to_string(),
            ..Self::default()
        }
    }

    /// A stored record only applies to the node it was written for.
    pub fn matches(&self, hardware: &str, role: &str) -> bool {
        self.hardware == hardware && self.role == role
    }

    pub fn to_json(&self) -> Result<String, FirmwareError> {
        serde_json::to_string(self).map_err(|e| FirmwareError::Store(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self, FirmwareError> {
        serde_json::from_str(s).map_err(|e| FirmwareError::Store(e.to_string()))
    }
}

/// Byte ranges of each part: `ceil(len / part_size)` parts, the last one short.
pub fn split_parts(len: usize, part_size: usize) -> Vec<Range<usize>> {
    let size = if part_size == 0 {
        DEFAULT_PART_SIZE
    } else {
        part_size
    };
    let mut out = Vec::with_capacity(len.div_ceil(size));
    let mut start = 0;
    while start < len {
        let end = (start + size).min(len);
        out.push(start..end);
        start = end;
    }
    out
}

/// Conventional file name for a build: `firmware_<hardware>_<role>.bin`.
pub fn image_file_name(hardware: &str, role: &str) -> String {
    format!("firmware_{}_{}.bin", hardware, role)
}

/// Inverse of [`image_file_name`]. Hardware names may not contain `_`; roles may.
pub fn parse_image_file_name(name: &str) -> Option<(String, String)> {
    let stem = name.strip_prefix("firmware_")?.strip_suffix(".bin")?;
    let (hardware, role) = stem.split_once('_')?;
    if hardware.is_empty() || role.is_empty() {
        return None;
    }
    Some((hardware.to_string(), role.to_string()))
}

/// A complete image held by a distributor.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    id: FirmwareId,
    bytes: Vec<u8>,
    parts: Vec<Range<usize>>,
}

impl FirmwareImage {
    pub fn new(hardware: &str, role: &str, bytes: Vec<u8>, part_size: usize) -> Self {
        let id = FirmwareId {
            md5: integrity::md5_hex(&bytes),
            hardware: hardware.to_string(),
            role: role.to_string(),
        };
        let parts = split_parts(bytes.len(), part_size);
        Self { id, bytes, parts }
    }

    pub fn id(&self) -> &FirmwareId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn no_part(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn part(&self, part_no: u32) -> Option<&[u8]> {
        let range = self.parts.get(part_no as usize)?;
        self.bytes.get(range.clone())
    }

    pub fn announce(&self, from: NodeId, forced: bool, broadcasted: bool) -> Announce {
        Announce {
            from,
            firmware: self.id.clone(),
            no_part: self.no_part(),
            forced,
            broadcasted,
        }
    }
}

/// Set of images a distributor serves; at most one per `(hardware, role)`.
#[derive(Debug, Default, Clone)]
pub struct ImageLibrary {
    images: Vec<FirmwareImage>,
}

impl ImageLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the image for its `(hardware, role)`.
    pub fn insert(&mut self, image: FirmwareImage) {
        self.images
            .retain(|i| !(i.id.hardware == image.id.hardware && i.id.role == image.id.role));
        self.images.push(image);
    }

    pub fn get(&self, firmware: &FirmwareId) -> Option<&FirmwareImage> {
        self.images.iter().find(|i| &i.id == firmware)
    }

    pub fn images(&self) -> &[FirmwareImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl FirmwareSource for ImageLibrary {
    fn chunk_at(&self, firmware: &FirmwareId, part_no: u32) -> Vec<u8> {
        self.get(firmware)
            .and_then(|img| img.part(part_no))
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    fn announcements(&self) -> Vec<(FirmwareId, u32)> {
        self.images
            .iter()
            .filter(|i| !i.is_empty())
            .map(|i| (i.id.clone(), i.no_part()))
            .collect()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use test_impls::{MemoryFlash, MemorySink, MemoryStore};

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! In-memory sink and store for tests. Built with `cfg(test)` or the
    //! `test-support` feature only.

    use std::sync::{Arc, Mutex};

    use super::{FirmwareError, FirmwareRecord, FirmwareSink, FirmwareWriter, StateStore};
    use crate::integrity::{self, FirmwareHasher};

    /// What an in-memory flash has seen. Shared so tests can inspect it after handing the
    /// sink to a node.
    #[derive(Debug, Default)]
    pub struct MemoryFlash {
        pub committed: Option<Vec<u8>>,
        pub begun: u32,
        pub aborted: u32,
        /// Fail every write from this part index (0-based chunk count) on.
        pub fail_after: Option<u32>,
    }

    /// In-memory [`FirmwareSink`] that verifies the MD5 on finalize.
    #[derive(Debug, Default, Clone)]
    pub struct MemorySink {
        flash: Arc<Mutex<MemoryFlash>>,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn flash(&self) -> Arc<Mutex<MemoryFlash>> {
            Arc::clone(&self.flash)
        }
    }

    impl FirmwareSink for MemorySink {
        fn begin_write(&mut self, size_hint: u64) -> Result<Box<dyn FirmwareWriter>, FirmwareError> {
            let mut flash = self
                .flash
                .lock()
                .map_err(|e| FirmwareError::Begin(e.to_string()))?;
            flash.begun += 1;
            Ok(Box::new(MemoryWriter {
                flash: Arc::clone(&self.flash),
                buf: Vec::with_capacity(size_hint.min(1 << 20) as usize),
                hasher: FirmwareHasher::new(),
                chunks: 0,
                done: false,
            }))
        }
    }

    struct MemoryWriter {
        flash: Arc<Mutex<MemoryFlash>>,
        buf: Vec<u8>,
        hasher: FirmwareHasher,
        chunks: u32,
        done: bool,
    }

    impl FirmwareWriter for MemoryWriter {
        fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), FirmwareError> {
            let fail_after = self.flash.lock().ok().and_then(|f| f.fail_after);
            if fail_after.is_some_and(|n| self.chunks >= n) {
                return Err(FirmwareError::Write("flash refused chunk".into()));
            }
            self.chunks += 1;
            self.hasher.update(bytes);
            self.buf.extend_from_slice(bytes);
            Ok(())
        }

        fn finalize(mut self: Box<Self>, expected_md5: &str) -> Result<(), FirmwareError> {
            let actual = self.hasher.clone().finish_hex();
            if !integrity::matches_md5(&actual, expected_md5) {
                return Err(FirmwareError::HashMismatch {
                    expected: expected_md5.to_string(),
                    actual,
                });
            }
            let mut flash = self
                .flash
                .lock()
                .map_err(|e| FirmwareError::Finalize(e.to_string()))?;
            flash.committed = Some(std::mem::take(&mut self.buf));
            self.done = true;
            Ok(())
        }
    }

    impl Drop for MemoryWriter {
        fn drop(&mut self) {
            if !self.done {
                if let Ok(mut flash) = self.flash.lock() {
                    flash.aborted += 1;
                }
            }
        }
    }

    /// In-memory [`StateStore`].
    #[derive(Debug, Default, Clone)]
    pub struct MemoryStore {
        record: Arc<Mutex<Option<FirmwareRecord>>>,
    }

    impl MemoryStore {
        pub fn new(initial: Option<FirmwareRecord>) -> Self {
            Self {
                record: Arc::new(Mutex::new(initial)),
            }
        }

        pub fn current(&self) -> Option<FirmwareRecord> {
            self.record.lock().ok().and_then(|r| r.clone())
        }
    }

    impl StateStore for MemoryStore {
        fn load(&self) -> Result<Option<FirmwareRecord>, FirmwareError> {
            self.record
                .lock()
                .map(|r| r.clone())
                .map_err(|e| FirmwareError::Store(e.to_string()))
        }

        fn save(&mut self, record: &FirmwareRecord) -> Result<(), FirmwareError> {
            let mut slot = self
                .record
                .lock()
                .map_err(|e| FirmwareError::Store(e.to_string()))?;
            *slot = Some(record.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parts_counts_and_bounds() {
        let parts = split_parts(100, 30);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], 0..30);
        assert_eq!(parts[3], 90..100);
        assert_eq!(split_parts(90, 30).len(), 3);
        assert_eq!(split_parts(10, 100), vec![0..10]);
        assert!(split_parts(0, 30).is_empty());
        assert_eq!(split_parts(DEFAULT_PART_SIZE * 2, 0).len(), 2);
    }

    #[test]
    fn image_parts_and_announce() {
        let bytes: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let img = FirmwareImage::new("ESP32", "sensor", bytes.clone(), 100);
        assert_eq!(img.no_part(), 3);
        assert_eq!(img.part(2).unwrap(), &bytes[200..]);
        assert!(img.part(3).is_none());
        assert_eq!(img.id().md5, integrity::md5_hex(&bytes));

        let ann = img.announce(NodeId(4), false, true);
        assert_eq!(ann.no_part, 3);
        assert!(ann.broadcasted);
        assert_eq!(ann.firmware.role, "sensor");
    }

    #[test]
    fn library_serves_only_known_builds() {
        let mut lib = ImageLibrary::new();
        let img = FirmwareImage::new("ESP32", "sensor", vec![1, 2, 3, 4], 2);
        let id = img.id().clone();
        lib.insert(img);
        assert_eq!(lib.chunk_at(&id, 1), vec![3, 4]);
        assert!(lib.chunk_at(&id, 2).is_empty());
        let other = FirmwareId {
            md5: "nope".into(),
            ..id.clone()
        };
        assert!(lib.chunk_at(&other, 0).is_empty());
        assert_eq!(lib.announcements(), vec![(id, 2)]);

        // Same hardware/role replaces.
        lib.insert(FirmwareImage::new("ESP32", "sensor", vec![9], 2));
        assert_eq!(lib.len(), 1);
    }

    #[test]
    fn file_names() {
        assert_eq!(image_file_name("ESP32", "node"), "firmware_ESP32_node.bin");
        assert_eq!(
            parse_image_file_name("firmware_ESP32_light_switch.bin"),
            Some(("ESP32".into(), "light_switch".into()))
        );
        assert_eq!(parse_image_file_name("firmware_ESP32.bin"), None);
        assert_eq!(parse_image_file_name("other.bin"), None);
    }

    #[test]
    fn record_json_and_match() {
        let rec = FirmwareRecord {
            md5: "abc".into(),
            hardware: "ESP32".into(),
            role: "node".into(),
            broadcasted: true,
        };
        let back = FirmwareRecord::from_json(&rec.to_json().unwrap()).unwrap();
        assert_eq!(back, rec);
        assert!(rec.matches("ESP32", "node"));
        assert!(!rec.matches("ESP8266", "node"));
        // Missing keys default.
        let partial = FirmwareRecord::from_json(r#"{"md5":"x"}"#).unwrap();
        assert_eq!(partial.role, "");
    }

    #[test]
    fn memory_sink_verifies_and_aborts_on_drop() {
        let mut sink = MemorySink::new();
        let flash = sink.flash();

        let mut w = sink.begin_write(3).unwrap();
        w.write_chunk(b"ab").unwrap();
        w.write_chunk(b"c").unwrap();
        w.finalize(&integrity::md5_hex(b"abc")).unwrap();
        assert_eq!(flash.lock().unwrap().committed.as_deref(), Some(&b"abc"[..]));

        let mut w = sink.begin_write(0).unwrap();
        w.write_chunk(b"x").unwrap();
        let err = w.finalize("00000000000000000000000000000000").unwrap_err();
        assert!(matches!(err, FirmwareError::HashMismatch { .. }));

        let w = sink.begin_write(0).unwrap();
        drop(w);
        let f = flash.lock().unwrap();
        assert_eq!(f.begun, 3);
        assert_eq!(f.aborted, 2);
    }

    #[test]
    fn memory_store_roundtrip() {
        let mut store = MemoryStore::new(None);
        assert_eq!(store.load().unwrap(), None);
        let rec = FirmwareRecord::new("ESP32", "node");
        store.save(&rec).unwrap();
        assert_eq!(store.current(), Some(rec));
    }
}
