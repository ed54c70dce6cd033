use tinyvec::ArrayVec;

use crate::parse_error::ParseError;

/// An ETag option value, 1..8 bytes on the wire; empty means "not present".
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Etag(pub ArrayVec<[u8; 8]>);

impl Etag {
  /// Construct an etag from raw bytes; errors when longer than 8 bytes.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
    if bytes.len() > 8 {
      return Err(ParseError::Malformed);
    }

    let mut v = ArrayVec::new();
    v.extend_from_slice(bytes);
    Ok(Etag(v))
  }

  /// The etag bytes
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Whether the option is absent
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}
