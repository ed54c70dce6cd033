/// Errors encounterable while decoding a message from wire bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseError {
  /// The bytes do not form a well-formed CoAP message for this transport:
  /// truncated header, bad version, reserved nibble values, option or
  /// payload running past the end of the buffer, invalid numeric field.
  Malformed,

  /// Token length nibble was > 8
  InvalidTokenLength(u8),

  /// An unknown *critical* option number was present
  OptionUnsupported(u16),

  /// More than 4 Uri-Path ids
  UriTooLong,

  /// More than [`crate::msg::LocationPath::MAX`] Location-Path segments
  TooManyLocationPaths,

  /// A decoded attribute (query item) exceeded the fixed per-item bound,
  /// or there were more query items than the decoder can hold
  AttrBufTooSmall,
}

impl ParseError {
  /// Shorthand for [`ParseError::Malformed`]
  pub fn eof() -> Self {
    Self::Malformed
  }
}

/// Errors encounterable while encoding a message to wire bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncodeError {
  /// The output buffer cannot hold the complete message; nothing was
  /// truncated.
  BufTooSmall,

  /// The message violates an invariant (§ message struct docs): payload
  /// without content-format, token too long, invalid block size, an
  /// operation/binding combination the wire format cannot express.
  InvalidMessage,
}
