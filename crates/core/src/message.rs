use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::headers;

/// Transport-level header map.
pub type Headers = BTreeMap<String, String>;

/// Message as seen by the transport: headers plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportMessage {
    headers: Headers,
    body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Builder-style header insertion.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The message id, or `None` when the header is absent or blank.
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Native delivery count, when the transport supplies one.
    ///
    /// Unparsable values are ignored.
    pub fn delivery_count(&self) -> Option<u32> {
        self.header(headers::DELIVERY_COUNT)
            .and_then(|v| v.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_message_id_counts_as_missing() {
        let msg = TransportMessage::default().with_header(headers::MESSAGE_ID, "   ");
        assert_eq!(msg.message_id(), None);

        let msg = TransportMessage::default().with_header(headers::MESSAGE_ID, "m1");
        assert_eq!(msg.message_id(), Some("m1"));
    }

    #[test]
    fn delivery_count_ignores_garbage() {
        let msg = TransportMessage::default().with_header(headers::DELIVERY_COUNT, "three");
        assert_eq!(msg.delivery_count(), None);

        let msg = TransportMessage::default().with_header(headers::DELIVERY_COUNT, " 7 ");
        assert_eq!(msg.delivery_count(), Some(7));
    }
}
