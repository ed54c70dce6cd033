use tinyvec::ArrayVec;

use crate::parse_error::ParseError;

/// An opaque correlator of 0..8 bytes, chosen by the requester and echoed
/// back in the response. Unique per in-flight exchange within a session.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Token(pub ArrayVec<[u8; 8]>);

impl Token {
  /// Maximum token length in bytes, per RFC 7252.
  pub const MAX_LEN: usize = 8;

  /// Construct a token from raw bytes; errors when `bytes` is longer than 8.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
    if bytes.len() > Self::MAX_LEN {
      return Err(ParseError::InvalidTokenLength(bytes.len() as u8));
    }

    let mut v = ArrayVec::new();
    v.extend_from_slice(bytes);
    Ok(Token(v))
  }

  /// The token bytes
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Number of bytes in the token
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether this is the zero-length token
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}
