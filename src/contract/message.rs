use std::collections::HashMap;

/// The wire-independent message envelope: payload bytes, an optional type tag
/// used for shared-destination routing, and free-form string headers carrying
/// routing metadata (for example a reply address set by the transport layer).
#[derive(Debug, Clone, Default)]
pub struct BinaryMessage {
    pub bytes: Vec<u8>,
    pub type_tag: Option<String>,
    pub headers: HashMap<String, String>,
}

impl BinaryMessage {
    pub fn new(bytes: Vec<u8>, type_tag: Option<String>) -> Self {
        BinaryMessage {
            bytes,
            type_tag,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}
