//! Typed payloads for each queue.

use serde::{Deserialize, Serialize};

use ticketflow_core::{TemplateId, TicketId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeJob {
    pub ticket_id: TicketId,
    #[serde(with = "base64_bytes")]
    pub file_bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

/// Subject and body are copied from the template at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkNotifyJob {
    pub template_id: TemplateId,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingNotifyJob {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Binary payloads travel as base64 strings inside the JSON job body.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_payload_encodes_bytes_as_base64() {
        let job = FinalizeJob {
            ticket_id: TicketId::new(),
            file_bytes: b"%PDF-1.7".to_vec(),
            file_name: "payment_proof".into(),
            mime_type: "application/pdf".into(),
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["file_bytes"], serde_json::json!("JVBERi0xLjc="));

        let back: FinalizeJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn finalize_payload_rejects_invalid_base64() {
        let value = serde_json::json!({
            "ticket_id": TicketId::new(),
            "file_bytes": "***",
            "file_name": "x",
            "mime_type": "image/png",
        });
        assert!(serde_json::from_value::<FinalizeJob>(value).is_err());
    }
}
