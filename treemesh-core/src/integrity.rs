//! Integrity: MD5 content hash identifying a firmware build, and post-write verification.
//!
//! MD5 is an identity here, not a security boundary.

use md5::{Digest, Md5};

/// Lowercase hex MD5 of a whole image.
pub fn md5_hex(payload: &[u8]) -> String {
    let mut h = FirmwareHasher::new();
    h.update(payload);
    h.finish_hex()
}

/// Case-insensitive comparison against an advertised hash.
pub fn matches_md5(actual_hex: &str, expected: &str) -> bool {
    actual_hex.eq_ignore_ascii_case(expected.trim())
}

/// Incremental hash over chunks as they are written.
#[derive(Clone, Default)]
pub struct FirmwareHasher {
    inner: Md5,
    len: u64,
}

impl FirmwareHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish_hex(self) -> String {
        self.inner
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
