use std::path::{Path, PathBuf};

use super::Algorithm;
use crate::error::SigningError;

/// Where key material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Serialized JWKS (or single JWK) bytes.
    Inline(Vec<u8>),
    /// Path to a file holding a JWKS.
    File(PathBuf),
    /// One raw key with an explicit algorithm.
    Single {
        key_id: String,
        algorithm: Algorithm,
        material: Vec<u8>,
    },
}

impl KeySource {
    /// Exactly one of `inline` and `file` must be given.
    pub fn select(inline: Option<&str>, file: Option<&Path>) -> Result<Self, SigningError> {
        match (inline, file) {
            (Some(inline), None) => Ok(KeySource::Inline(inline.as_bytes().to_vec())),
            (None, Some(file)) => Ok(KeySource::File(file.to_path_buf())),
            (Some(_), Some(_)) => Err(SigningError::InvalidKeySource(
                "an inline key set and a key set file were both supplied".to_string(),
            )),
            (None, None) => Err(SigningError::InvalidKeySource(
                "no key set was supplied".to_string(),
            )),
        }
    }

    /// Serialized key set bytes, reading the file for [`KeySource::File`].
    pub fn read_bytes(&self) -> Result<Vec<u8>, SigningError> {
        match self {
            KeySource::Inline(bytes) => Ok(bytes.clone()),
            KeySource::File(path) => {
                tracing::debug!(path = %path.display(), "reading key set file");
                std::fs::read(path).map_err(|e| SigningError::KeySourceRead {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
            KeySource::Single { key_id, .. } => Err(SigningError::InvalidKeySource(format!(
                "{key_id} is a single raw key, not a key set"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn exactly_one_source_is_required() {
        assert!(matches!(
            KeySource::select(None, None),
            Err(SigningError::InvalidKeySource(_))
        ));
        assert!(matches!(
            KeySource::select(Some("{}"), Some(Path::new("keys.json"))),
            Err(SigningError::InvalidKeySource(_))
        ));
        assert_eq!(
            KeySource::select(Some("{}"), None).unwrap(),
            KeySource::Inline(b"{}".to_vec())
        );
    }

    #[test]
    fn file_source_reads_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"keys\":[]}").unwrap();
        let source = KeySource::select(None, Some(file.path())).unwrap();
        assert_eq!(source.read_bytes().unwrap(), b"{\"keys\":[]}");
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let source = KeySource::File(PathBuf::from("/nonexistent/keys.json"));
        match source.read_bytes() {
            Err(SigningError::KeySourceRead { path, .. }) => {
                assert_eq!(path, "/nonexistent/keys.json")
            }
            other => panic!("expected KeySourceRead, got {other:?}"),
        }
    }
}
