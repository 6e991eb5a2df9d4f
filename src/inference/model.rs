//! Model package handling
//!
//! Resolves a model package directory to its GGUF payload and validates the
//! file header before the engine attempts a load.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Errors that can occur while resolving or validating a model package
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("No .gguf model found in {}", .0.display())]
    NoModelFound(PathBuf),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Resolves a model package to its weight file.
///
/// Accepts either a pre-exported package directory (the `.gguf` file inside
/// is located, first in lexicographic order when there are several) or a
/// direct path to a `.gguf` file.
pub fn locate_model_file<P: AsRef<Path>>(package: P) -> Result<PathBuf, ModelError> {
    let package = package.as_ref();

    if package.is_file() {
        return Ok(package.to_path_buf());
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(package)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::NoModelFound(package.to_path_buf()))
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
///
/// # Arguments
/// * `path` - Path to the GGUF file
///
/// # Returns
/// * `Ok(GgufMetadata)` - Metadata extracted from valid GGUF file
/// * `Err(ModelError)` - If the file is not a valid GGUF file
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    // Check file size (minimum: magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8) = 24 bytes)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    // Read magic bytes (4 bytes, little-endian)
    let mut magic_bytes = [0u8; 4];
    file.read_exact(&mut magic_bytes)?;
    let magic = u32::from_le_bytes(magic_bytes);

    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // Read version (4 bytes, little-endian)
    let mut version_bytes = [0u8; 4];
    file.read_exact(&mut version_bytes)?;
    let version = u32::from_le_bytes(version_bytes);

    // GGUF v2 and v3 are supported
    if version < 2 || version > 3 {
        return Err(ModelError::UnsupportedVersion(version));
    }

    // Read tensor count (8 bytes, little-endian)
    let mut tensor_count_bytes = [0u8; 8];
    file.read_exact(&mut tensor_count_bytes)?;
    let tensor_count = u64::from_le_bytes(tensor_count_bytes);

    // Read metadata kv count (8 bytes, little-endian)
    let mut metadata_kv_count_bytes = [0u8; 8];
    file.read_exact(&mut metadata_kv_count_bytes)?;
    let metadata_kv_count = u64::from_le_bytes(metadata_kv_count_bytes);

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_gguf_header(file: &mut impl Write) {
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap(); // magic
        file.write_all(&3u32.to_le_bytes()).unwrap(); // version 3
        file.write_all(&10u64.to_le_bytes()).unwrap(); // tensor_count
        file.write_all(&5u64.to_le_bytes()).unwrap(); // metadata_kv_count
    }

    fn create_test_gguf() -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_gguf_header(&mut file);
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_validate_gguf_valid() {
        let file = create_test_gguf();
        let metadata = validate_gguf(file.path()).unwrap();

        assert_eq!(metadata.version, 3);
        assert_eq!(metadata.tensor_count, 10);
        assert_eq!(metadata.metadata_kv_count, 5);
    }

    #[test]
    fn test_validate_gguf_invalid_magic() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();

        // Write invalid magic
        file.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        file.write_all(&3u32.to_le_bytes()).unwrap();
        file.write_all(&10u64.to_le_bytes()).unwrap();
        file.write_all(&5u64.to_le_bytes()).unwrap();
        file.flush().unwrap();

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_validate_gguf_file_too_small() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();

        // Write only magic bytes
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::FileTooSmall)));
    }

    #[test]
    fn test_locate_model_file_in_package_dir() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model-int4.gguf");
        let mut file = File::create(&model_path).unwrap();
        write_gguf_header(&mut file);
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();

        let located = locate_model_file(dir.path()).unwrap();
        assert_eq!(located, model_path);
    }

    #[test]
    fn test_locate_model_file_prefers_first_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"x").unwrap();

        let located = locate_model_file(dir.path()).unwrap();
        assert_eq!(located, dir.path().join("a.gguf"));
    }

    #[test]
    fn test_locate_model_file_direct_path() {
        let file = create_test_gguf();
        let located = locate_model_file(file.path()).unwrap();
        assert_eq!(located, file.path());
    }

    #[test]
    fn test_locate_model_file_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = locate_model_file(dir.path());
        assert!(matches!(result, Err(ModelError::NoModelFound(_))));
    }

    #[test]
    fn test_locate_model_file_missing_dir() {
        let result = locate_model_file("/definitely/not/a/real/path");
        assert!(matches!(result, Err(ModelError::FileOpen(_))));
    }
}
