//! Integrity validation for downloaded artifacts
//!
//! Pure with respect to state: every check only reads the file. Checks
//! short-circuit on first failure, cheapest first.

use crate::error::{VaultError, VaultResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Smallest size a real artifact file can plausibly have
///
/// Rejects empty and header-truncated downloads while admitting small JSON
/// sidecars like tokenizer configs.
pub const MIN_PLAUSIBLE_BYTES: u64 = 16;

/// Validate one downloaded file
///
/// Order: existence and size, then checksum (when one is known), then a
/// container-format structural check keyed on the file extension.
pub fn validate_file(
    path: &Path,
    expected_size: Option<u64>,
    expected_sha256: Option<&str>,
) -> VaultResult<()> {
    let metadata = std::fs::metadata(path).map_err(|_| VaultError::IntegrityMismatch {
        path: path.to_path_buf(),
        reason: "file missing".to_string(),
    })?;

    let len = metadata.len();
    if len < MIN_PLAUSIBLE_BYTES {
        return Err(VaultError::IntegrityMismatch {
            path: path.to_path_buf(),
            reason: format!("file truncated: {} bytes", len),
        });
    }

    if let Some(expected) = expected_size
        && len != expected
    {
        return Err(VaultError::IntegrityMismatch {
            path: path.to_path_buf(),
            reason: format!("size mismatch: expected {} bytes, got {}", expected, len),
        });
    }

    if let Some(expected) = expected_sha256 {
        let actual = compute_sha256(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(VaultError::IntegrityMismatch {
                path: path.to_path_buf(),
                reason: format!("sha256 mismatch: expected {}, got {}", expected, actual),
            });
        }
    }

    check_container_format(path, len)
}

/// Streaming SHA-256 of a file, as lowercase hex
pub fn compute_sha256(path: &Path) -> VaultResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Structural sanity check for self-describing container formats
fn check_container_format(path: &Path, len: u64) -> VaultResult<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match extension.as_str() {
        "safetensors" => check_safetensors(path, len),
        "bin" | "pt" | "pth" => check_legacy_archive(path, len),
        _ => Ok(()),
    }
}

/// Safetensors layout: 8-byte little-endian header length, JSON header, then
/// the tensor payload. The declared header must fit strictly inside the file.
fn check_safetensors(path: &Path, len: u64) -> VaultResult<()> {
    let mut file = File::open(path)?;

    let mut prefix = [0u8; 8];
    file.read_exact(&mut prefix)
        .map_err(|_| integrity(path, "safetensors header prefix unreadable"))?;
    let header_len = u64::from_le_bytes(prefix);

    if header_len == 0 || 8u64.saturating_add(header_len) >= len {
        return Err(integrity(
            path,
            &format!("safetensors header length {} exceeds file size {}", header_len, len),
        ));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .map_err(|_| integrity(path, "safetensors header truncated"))?;

    match serde_json::from_slice::<serde_json::Value>(&header) {
        Ok(value) if value.is_object() => Ok(()),
        _ => Err(integrity(path, "safetensors header is not a JSON object")),
    }
}

/// Metadata-only envelope check for legacy serialized tensors
///
/// Accepts the zip container newer serializers emit (local-file magic up
/// front plus an end-of-central-directory record near the tail) or a bare
/// pickle protocol marker. Nothing inside is deserialized or executed.
fn check_legacy_archive(path: &Path, len: u64) -> VaultResult<()> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| integrity(path, "legacy archive magic unreadable"))?;

    if magic.starts_with(b"PK\x03\x04") {
        // Zip container: the end-of-central-directory record must appear in
        // the final 64 KiB (comment field is at most 65535 bytes).
        let tail_len = len.min(66_000);
        let mut tail = vec![0u8; tail_len as usize];
        file.seek(SeekFrom::End(-(tail_len as i64)))?;
        file.read_exact(&mut tail)
            .map_err(|_| integrity(path, "zip tail unreadable"))?;

        if tail.windows(4).any(|w| w == b"PK\x05\x06") {
            return Ok(());
        }
        return Err(integrity(path, "zip end-of-central-directory record missing"));
    }

    if magic[0] == 0x80 && (2..=5).contains(&magic[1]) {
        // Bare pickle stream with an explicit protocol marker
        return Ok(());
    }

    Err(integrity(path, "unrecognized legacy tensor envelope"))
}

fn integrity(path: &Path, reason: &str) -> VaultError {
    VaultError::IntegrityMismatch {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
