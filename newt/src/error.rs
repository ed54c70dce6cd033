use newt_msg::{Code, EncodeError, ParseError};

/// The error union surfaced by the public session API and propagated
/// between the runtime's layers.
///
/// CoAP response codes travel as [`Error::Coap`] — e.g. a handler
/// refusing a write with 4.05 or a server answering 4.04. Network-level
/// conditions keep their own variants so callers can distinguish "try
/// again next tick" from real failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
  /// A CoAP-level failure, carrying the response code
  Coap(Code),
  /// The transport reported an unrecoverable error
  Network,
  /// The operation could not complete yet; call again on a later tick
  Again,
  /// A datagram exceeded the receive buffer / inner MTU
  MsgSize,
  /// The requested feature is not compiled in or not supported here
  NotSupported,
  /// The peer never answered within the retransmission schedule
  Timeout,
  /// The exchange was cancelled before completing
  Terminated,
  /// The peer answered with a CoAP Reset (e.g. rejecting a notification)
  Reset,
  /// A fixed internal buffer was too small for the data at hand
  Buffer,
  /// The message could not be parsed or encoded
  Codec,
  /// The configuration is invalid or incomplete
  InvalidConfig,
}

impl Error {
  /// Shorthand for `Error::Coap(Code::NOT_FOUND)`
  pub const NOT_FOUND: Self = Error::Coap(Code::NOT_FOUND);
  /// Shorthand for `Error::Coap(Code::METHOD_NOT_ALLOWED)`
  pub const METHOD_NOT_ALLOWED: Self = Error::Coap(Code::METHOD_NOT_ALLOWED);
  /// Shorthand for `Error::Coap(Code::BAD_REQUEST)`
  pub const BAD_REQUEST: Self = Error::Coap(Code::BAD_REQUEST);
  /// Shorthand for `Error::Coap(Code::UNAUTHORIZED)`
  pub const UNAUTHORIZED: Self = Error::Coap(Code::UNAUTHORIZED);
  /// Shorthand for `Error::Coap(Code::INTERNAL_SERVER_ERROR)`
  pub const INTERNAL: Self = Error::Coap(Code::INTERNAL_SERVER_ERROR);

  /// The CoAP response code to answer a server request that failed with
  /// this error.
  pub fn response_code(&self) -> Code {
    match self {
      | Error::Coap(code) => *code,
      | Error::Buffer => Code::INTERNAL_SERVER_ERROR,
      | Error::NotSupported => Code::NOT_IMPLEMENTED,
      | _ => Code::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<ParseError> for Error {
  fn from(_: ParseError) -> Self {
    Error::Codec
  }
}

impl From<EncodeError> for Error {
  fn from(e: EncodeError) -> Self {
    match e {
      | EncodeError::BufTooSmall => Error::Buffer,
      | EncodeError::InvalidMessage => Error::Codec,
    }
  }
}

impl From<Code> for Error {
  fn from(code: Code) -> Self {
    Error::Coap(code)
  }
}
