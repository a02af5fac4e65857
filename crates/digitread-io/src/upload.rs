//! Validation and reading of user-supplied image files.

use std::path::Path;

/// Allowed file extensions for image uploads.
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png", "gif", "webp", "bmp"];

/// Largest accepted upload, in bytes.
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Why an upload was refused. The message is meant for the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadRejection {
    /// The file name does not carry an accepted image extension.
    #[error("unsupported file type: {name} (expected one of jpeg, jpg, png, gif, webp, bmp)")]
    UnsupportedType {
        /// Offending file name.
        name: String,
    },

    /// The file exceeds [`MAX_UPLOAD_BYTES`].
    #[error("file is too large: {size} bytes (limit is {limit} bytes)")]
    TooLarge {
        /// Size of the file.
        size: u64,
        /// Accepted maximum.
        limit: u64,
    },
}

/// Errors from reading an upload.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// The file was refused before reading.
    #[error(transparent)]
    Rejected(#[from] UploadRejection),

    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Check whether a filename has an allowed image extension.
#[must_use]
pub fn has_allowed_extension(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(_, ext)| {
        ALLOWED_EXTENSIONS
            .iter()
            .any(|a| a.eq_ignore_ascii_case(ext))
    })
}

/// Accept or refuse an upload by name and size.
///
/// # Errors
///
/// Returns [`UploadRejection::UnsupportedType`] for a disallowed
/// extension and [`UploadRejection::TooLarge`] above
/// [`MAX_UPLOAD_BYTES`].
pub fn validate_upload(name: &str, size: u64) -> Result<(), UploadRejection> {
    if !has_allowed_extension(name) {
        return Err(UploadRejection::UnsupportedType {
            name: name.to_owned(),
        });
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(UploadRejection::TooLarge {
            size,
            limit: MAX_UPLOAD_BYTES,
        });
    }
    Ok(())
}

/// Validate and read an image file.
///
/// The size check uses file metadata, so oversized files are refused
/// without being read.
///
/// # Errors
///
/// Returns [`IoError::Rejected`] if validation fails and
/// [`IoError::Read`] if the file cannot be accessed.
pub fn read_upload(path: &Path) -> Result<Vec<u8>, IoError> {
    let read_error = |source| IoError::Read {
        path: path.display().to_string(),
        source,
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let size = std::fs::metadata(path).map_err(read_error)?.len();
    validate_upload(&name, size)?;
    let bytes = std::fs::read(path).map_err(read_error)?;
    log::debug!("read {} bytes from {}", bytes.len(), path.display());
    Ok(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_listed_extensions_in_any_case() {
        for name in ["a.png", "b.JPG", "c.jpeg", "d.Gif", "e.webp", "f.bmp", "g.tar.png"] {
            assert!(has_allowed_extension(name), "{name}");
        }
    }

    #[test]
    fn refuses_other_names() {
        for name in ["a.svg", "b.pdf", "png", "c.", "noext"] {
            assert!(!has_allowed_extension(name), "{name}");
        }
    }

    #[test]
    fn size_limit_is_inclusive() {
        assert!(validate_upload("a.png", MAX_UPLOAD_BYTES).is_ok());
        assert_eq!(
            validate_upload("a.png", MAX_UPLOAD_BYTES + 1),
            Err(UploadRejection::TooLarge {
                size: MAX_UPLOAD_BYTES + 1,
                limit: MAX_UPLOAD_BYTES
            })
        );
    }

    #[test]
    fn rejection_message_names_the_file() {
        let err = validate_upload("notes.txt", 10).unwrap_err();
        assert!(err.to_string().contains("notes.txt"));
    }

    #[test]
    fn read_upload_returns_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digits.png");
        std::fs::write(&path, b"not really a png").unwrap();
        assert_eq!(read_upload(&path).unwrap(), b"not really a png");
    }

    #[test]
    fn read_upload_checks_extension_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digits.txt");
        std::fs::write(&path, b"123").unwrap();
        assert!(matches!(
            read_upload(&path),
            Err(IoError::Rejected(UploadRejection::UnsupportedType { .. }))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_upload(&dir.path().join("missing.png")),
            Err(IoError::Read { .. })
        ));
    }
}
