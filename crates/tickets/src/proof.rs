//! Payment proof upload rules.

use ticketflow_core::{DomainError, DomainResult, TicketId};

pub const ALLOWED_MIME_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "application/pdf",
];

/// 50 MiB.
pub const DEFAULT_MAX_PROOF_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofUpload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ProofUpload {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn validate(&self, max_bytes: usize) -> DomainResult<()> {
        if self.bytes.is_empty() {
            return Err(DomainError::validation("No file uploaded"));
        }
        if !ALLOWED_MIME_TYPES.contains(&self.mime_type.as_str()) {
            return Err(DomainError::validation(format!(
                "unsupported file type: {}",
                self.mime_type
            )));
        }
        if self.bytes.len() > max_bytes {
            return Err(DomainError::validation(format!(
                "file exceeds {max_bytes} bytes"
            )));
        }
        Ok(())
    }

    /// Extension derived from the mime subtype (`image/png` -> `png`).
    pub fn extension(&self) -> &str {
        mime_subtype(&self.mime_type)
    }
}

pub fn mime_subtype(mime_type: &str) -> &str {
    mime_type
        .split_once('/')
        .map(|(_, sub)| sub)
        .unwrap_or(mime_type)
}

/// Base name of the stored object for a ticket's proof.
pub fn proof_object_name(id: TicketId) -> String {
    format!("payment_proof_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_allowed_types_within_limit() {
        let upload = ProofUpload::new("image/png", vec![1, 2, 3]);
        assert!(upload.validate(DEFAULT_MAX_PROOF_BYTES).is_ok());
        assert_eq!(upload.extension(), "png");
    }

    #[test]
    fn rejects_empty_file() {
        let err = ProofUpload::new("application/pdf", vec![])
            .validate(DEFAULT_MAX_PROOF_BYTES)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg == "No file uploaded"));
    }

    #[test]
    fn rejects_disallowed_type_and_oversize() {
        assert!(ProofUpload::new("text/plain", vec![1]).validate(10).is_err());
        assert!(ProofUpload::new("image/gif", vec![0; 11]).validate(10).is_err());
        assert!(ProofUpload::new("image/gif", vec![0; 10]).validate(10).is_ok());
    }

    #[test]
    fn object_name_is_keyed_by_ticket() {
        let id = TicketId::new();
        assert_eq!(proof_object_name(id), format!("payment_proof_{id}"));
    }
}
