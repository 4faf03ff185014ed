use bytes::Bytes;

/// A single accepted write request, queued for forwarding.
///
/// The body is the gzip-compressed payload exactly as the agent sent it. A batch is never
/// modified once it has been created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    correlation_id: String,
    body: Bytes,
    api_key: String,
}

impl Batch {
    pub fn new(correlation_id: impl Into<String>, body: Bytes, api_key: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body,
            api_key: api_key.into(),
        }
    }

    /// The id minted for the request that produced this batch, empty if none was assigned
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Size of the compressed body in bytes
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
