use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Control message opening a file transfer.
///
/// Exactly one is sent per transfer, as a text message, before any chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Suggested file name for the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Total payload size in bytes.
    pub size: u64,
    /// SHA-256 hex digest of the whole payload, if the sender computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl TransferMetadata {
    pub fn new(name: Option<String>, size: u64) -> Self {
        Self {
            name,
            size,
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Number of chunk messages that follow this metadata.
    pub fn chunk_count(&self, chunk_size: usize) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        self.size.div_ceil(chunk_size as u64)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let meta: TransferMetadata = serde_json::from_str(text)?;
        if let Some(checksum) = &meta.checksum {
            if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ProtocolError::Invalid(format!(
                    "checksum is not a SHA-256 hex digest: {checksum}"
                )));
            }
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CHUNK_SIZE;

    #[test]
    fn chunk_count_rounds_up() {
        let meta = TransferMetadata::new(None, 20_000);
        assert_eq!(meta.chunk_count(CHUNK_SIZE), 2);

        let exact = TransferMetadata::new(None, (CHUNK_SIZE * 3) as u64);
        assert_eq!(exact.chunk_count(CHUNK_SIZE), 3);
    }

    #[test]
    fn empty_transfer_has_no_chunks() {
        let meta = TransferMetadata::new(Some("empty.txt".into()), 0);
        assert_eq!(meta.chunk_count(CHUNK_SIZE), 0);
    }

    #[test]
    fn json_omits_missing_name_and_checksum() {
        let json = TransferMetadata::new(None, 5).to_json().unwrap();
        assert_eq!(json, r#"{"size":5}"#);
    }

    #[test]
    fn from_json_reads_name() {
        let meta = TransferMetadata::from_json(r#"{"name":"photo.jpg","size":1024}"#).unwrap();
        assert_eq!(meta.name.as_deref(), Some("photo.jpg"));
        assert_eq!(meta.size, 1024);
        assert!(meta.checksum.is_none());
    }

    #[test]
    fn from_json_rejects_malformed_checksum() {
        let result = TransferMetadata::from_json(r#"{"size":1,"checksum":"zz"}"#);
        assert!(matches!(result, Err(ProtocolError::Invalid(_))));
    }

    #[test]
    fn from_json_rejects_bare_number() {
        assert!(TransferMetadata::from_json("20000").is_err());
    }
}
