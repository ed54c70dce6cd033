use crate::parse_error::ParseError;

/// Indicates if a UDP message is of type Confirmable (0),
/// Non-confirmable (1), Acknowledgement (2), or Reset (3).
///
/// See [RFC7252 - Message Details](https://datatracker.ietf.org/doc/html/rfc7252#section-3).
#[derive(Copy, Clone, Hash, Eq, Ord, PartialEq, PartialOrd, Debug, Default)]
pub enum Type {
  /// Requires an acknowledgement; retransmitted until one arrives.
  #[default]
  Con,
  /// Fire-and-forget.
  Non,
  /// Acknowledges a specific Confirmable message, possibly carrying a
  /// piggybacked response.
  Ack,
  /// The peer received the message but lacks the context to process it.
  Reset,
}

impl Type {
  pub(crate) fn bits(self) -> u8 {
    match self {
      | Type::Con => 0,
      | Type::Non => 1,
      | Type::Ack => 2,
      | Type::Reset => 3,
    }
  }
}

impl TryFrom<u8> for Type {
  type Error = ParseError;

  fn try_from(b: u8) -> Result<Self, Self::Error> {
    match b {
      | 0 => Ok(Type::Con),
      | 1 => Ok(Type::Non),
      | 2 => Ok(Type::Ack),
      | 3 => Ok(Type::Reset),
      | _ => Err(ParseError::Malformed),
    }
  }
}
