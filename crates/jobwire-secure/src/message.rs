use std::str::Utf8Error;

use bytes::Bytes;

/// Clear-text application payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message(Bytes);

impl Message {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Payload as text; one trailing NUL terminator is dropped if present.
    pub fn as_text(&self) -> Result<&str, Utf8Error> {
        let bytes = self.0.strip_suffix(&[0u8]).unwrap_or(&self.0);
        std::str::from_utf8(bytes)
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Message {
    fn from(v: &'static [u8]) -> Self {
        Self(Bytes::from_static(v))
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
