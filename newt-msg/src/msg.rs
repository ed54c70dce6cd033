use tinyvec::ArrayVec;

use crate::attr::{self, Attrs, BootstrapAttrs, DiscoverAttrs, NotificationAttrs, RegisterAttrs,
                  ATTR_ITEM_MAX, QUERY_ITEMS_MAX};
use crate::block::{Block, BlockKind};
use crate::code::{Code, CodeKind};
use crate::content_format::ContentFormat;
use crate::cursor::Cursor;
use crate::etag::Etag;
use crate::id::Id;
use crate::op::Operation;
use crate::opt::{self, OptReader, OptWriter};
use crate::parse_error::{EncodeError, ParseError};
use crate::path::{UriPath, ID_NONE};
use crate::token::Token;
use crate::ty::Type;

/// Most Location-Path segments a message may carry.
pub(crate) const MAX_LOCATION_PATHS: usize = 4;

/// Location-Path segments, borrowed from the decoded buffer (or from the
/// session's stored registration location on encode).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct LocationPath<'a> {
  /// The segments in order, e.g. `["rd", "5a3f"]`
  pub segments: ArrayVec<[&'a str; MAX_LOCATION_PATHS]>,
}

impl<'a> LocationPath<'a> {
  /// Most Location-Path segments a message may carry.
  pub const MAX: usize = MAX_LOCATION_PATHS;

  /// Build from a slice of segments; errors past [`Self::MAX`].
  pub fn from_segments(segments: &[&'a str]) -> Result<Self, ParseError> {
    if segments.len() > Self::MAX {
      return Err(ParseError::TooManyLocationPaths);
    }

    let mut v = ArrayVec::new();
    v.extend_from_slice(segments);
    Ok(Self { segments: v })
  }

  /// Whether no segments are present
  pub fn is_empty(&self) -> bool {
    self.segments.is_empty()
  }
}

/// Transport-specific correlation data.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Binding {
  /// UDP: message id + CON/NON/ACK/RST type
  Udp {
    /// Message id echoed by ACKs
    id: Id,
    /// Message type
    ty: Type,
  },
  /// TCP: the stream provides ordering; no id, no type
  Tcp,
}

impl Default for Binding {
  fn default() -> Self {
    Binding::Udp { id: Id(0), ty: Type::Con }
  }
}

/// RFC 8323 signalling payload (TCP only).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Signalling {
  /// Not a signalling message
  #[default]
  None,
  /// 7.01 Capabilities and Settings
  Csm {
    /// Max-Message-Size option (default 1152 when absent)
    max_msg_size: u32,
    /// Block-Wise-Transfer capability flag
    block_wise: bool,
  },
  /// 7.02 Ping
  Ping {
    /// Custody option
    custody: bool,
  },
  /// 7.03 Pong
  Pong {
    /// Custody option
    custody: bool,
  },
}

/// One uniform CoAP message: the decoded form every layer above the codec
/// operates on, and the form the encoders serialize.
///
/// ## Invariants
/// - token ≤ 8 bytes, uri depth ≤ 4, ≤ [`LocationPath::MAX`] location
///   segments (enforced by the field types)
/// - a non-empty payload requires `content_format` to be set
/// - at most one block "which" per UDP message ([`BlockKind::Both`]
///   expands to a Block2+Block1 pair on the wire)
///
/// The payload and all strings borrow from the buffer the message was
/// decoded out of; nothing is copied.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Message<'a> {
  /// LwM2M-level classification; recomputed on decode
  pub operation: Operation,
  /// CoAP method / response code
  pub code: Code,
  /// Exchange correlator
  pub token: Token,
  /// Numeric data-model path (empty for named paths like `/rd`, `/bs`)
  pub uri: UriPath,
  /// Media type of `payload`
  pub content_format: Option<ContentFormat>,
  /// Preferred response media type
  pub accept: Option<ContentFormat>,
  /// Observe option (24-bit)
  pub observe: Option<u32>,
  /// Block1 / Block2 descriptor
  pub block: Option<Block>,
  /// ETag option
  pub etag: Etag,
  /// Location-Path (register response, create response) — or, for
  /// Update / De-register requests, the stored registration path to
  /// re-emit as Uri-Path
  pub location_path: LocationPath<'a>,
  /// Operation-specific query / response attributes
  pub attrs: Attrs<'a>,
  /// Body bytes; borrowed, never copied
  pub payload: &'a [u8],
  /// UDP or TCP correlation data
  pub binding: Binding,
  /// TCP signalling options
  pub signalling: Signalling,
}

impl<'a> Message<'a> {
  /// The UDP message id, when this message came over (or goes out over)
  /// UDP.
  pub fn msg_id(&self) -> Option<Id> {
    match self.binding {
      | Binding::Udp { id, .. } => Some(id),
      | Binding::Tcp => None,
    }
  }

  /// The UDP message type, if any.
  pub fn msg_type(&self) -> Option<Type> {
    match self.binding {
      | Binding::Udp { ty, .. } => Some(ty),
      | Binding::Tcp => None,
    }
  }

  /// Validate the cross-field invariants the wire format cannot express.
  pub fn check(&self) -> Result<(), EncodeError> {
    if !self.payload.is_empty() && self.content_format.is_none() {
      return Err(EncodeError::InvalidMessage);
    }

    if let Some(b) = self.block {
      if !Block::size_valid(b.size) {
        return Err(EncodeError::InvalidMessage);
      }
    }

    Ok(())
  }
}

/// Named (non-numeric) request path recognized by the classifier.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum NamedPath {
  None,
  Bs,
  Bspack,
  Dp,
  Rd,
  Other,
}

/// Decoded option fields prior to classification.
struct Fields<'a> {
  uri: UriPath,
  named: NamedPath,
  named_segments: ArrayVec<[&'a str; MAX_LOCATION_PATHS]>,
  location: ArrayVec<[&'a str; MAX_LOCATION_PATHS]>,
  query: ArrayVec<[&'a str; QUERY_ITEMS_MAX]>,
  content_format: Option<ContentFormat>,
  accept: Option<ContentFormat>,
  observe: Option<u32>,
  block1: Option<Block>,
  block2: Option<Block>,
  etag: Etag,
  payload: &'a [u8],
}

fn uint_opt(value: &[u8], max_len: usize) -> Result<u32, ParseError> {
  if value.len() > max_len {
    return Err(ParseError::Malformed);
  }

  Ok(value.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

fn str_opt(value: &[u8]) -> Result<&str, ParseError> {
  core::str::from_utf8(value).map_err(|_| ParseError::Malformed)
}

fn decode_fields<'a>(mut reader: OptReader<'a>) -> Result<Fields<'a>, ParseError> {
  let mut f = Fields { uri: UriPath::root(),
                       named: NamedPath::None,
                       named_segments: ArrayVec::new(),
                       location: ArrayVec::new(),
                       query: ArrayVec::new(),
                       content_format: None,
                       accept: None,
                       observe: None,
                       block1: None,
                       block2: None,
                       etag: Etag::default(),
                       payload: &[] };
  let mut uri_segments = 0usize;

  while let Some(o) = reader.next_opt()? {
    match o.number {
      | opt::ETAG => f.etag = Etag::from_bytes(o.value)?,
      | opt::OBSERVE => f.observe = Some(uint_opt(o.value, 3)?),
      | opt::LOCATION_PATH => {
        if f.location.len() == LocationPath::MAX {
          return Err(ParseError::TooManyLocationPaths);
        }
        f.location.push(str_opt(o.value)?);
      },
      | opt::URI_PATH => {
        let seg = str_opt(o.value)?;
        if seg.is_empty() {
          return Err(ParseError::Malformed);
        }

        let numeric = seg.bytes().all(|b| b.is_ascii_digit());
        match (uri_segments, numeric, f.named) {
          | (_, true, NamedPath::None) => {
            let id = attr::parse_u16(seg)?;
            if id == ID_NONE {
              return Err(ParseError::Malformed);
            }
            f.uri = f.uri.join(id)?;
          },
          | (0, false, _) => {
            f.named = match seg {
              | "bs" => NamedPath::Bs,
              | "bspack" => NamedPath::Bspack,
              | "dp" => NamedPath::Dp,
              | "rd" => NamedPath::Rd,
              | _ => NamedPath::Other,
            };
            f.named_segments.push(seg);
          },
          | (_, _, named) if named != NamedPath::None => {
            // named paths keep their raw segments (e.g. rd/5a3f)
            if f.named_segments.len() == LocationPath::MAX {
              return Err(ParseError::UriTooLong);
            }
            f.named_segments.push(seg);
          },
          | _ => return Err(ParseError::Malformed),
        }
        uri_segments += 1;
      },
      | opt::CONTENT_FORMAT => {
        f.content_format = Some(ContentFormat(uint_opt(o.value, 2)? as u16))
      },
      | opt::URI_QUERY => {
        let item = str_opt(o.value)?;
        if item.len() > ATTR_ITEM_MAX || f.query.len() == QUERY_ITEMS_MAX {
          return Err(ParseError::AttrBufTooSmall);
        }
        f.query.push(item);
      },
      | opt::ACCEPT => f.accept = Some(ContentFormat(uint_opt(o.value, 2)? as u16)),
      | opt::BLOCK2 => f.block2 = Some(Block::from_raw(BlockKind::B2, uint_opt(o.value, 3)?)?),
      | opt::BLOCK1 => f.block1 = Some(Block::from_raw(BlockKind::B1, uint_opt(o.value, 3)?)?),
      | opt::IF_MATCH
      | opt::URI_HOST
      | opt::IF_NONE_MATCH
      | opt::URI_PORT
      | opt::MAX_AGE
      | opt::LOCATION_QUERY
      | opt::SIZE1
      | opt::SIZE2 => {
        // understood, carried no state we track
      },
      | n if opt::is_critical(n) => return Err(ParseError::OptionUnsupported(n)),
      | _ => {
        // elective & unknown: skip
      },
    }
  }

  f.payload = reader.into_payload()?;
  Ok(f)
}

fn classify(code: Code, binding: Binding, f: &Fields<'_>) -> Result<Operation, ParseError> {
  let ty = match binding {
    | Binding::Udp { ty, .. } => Some(ty),
    | Binding::Tcp => None,
  };

  Ok(match code.kind() {
    | CodeKind::Empty => match ty {
      | Some(Type::Reset) => Operation::CoapReset,
      | Some(Type::Con) => Operation::CoapPingUdp,
      | _ => Operation::CoapEmptyMsg,
    },
    | CodeKind::Response => Operation::Response,
    | CodeKind::Signalling => match code {
      | Code::CSM => Operation::CoapCsm,
      | Code::PING => Operation::CoapPing,
      | Code::PONG => Operation::CoapPong,
      | Code::RELEASE => Operation::CoapRelease,
      | Code::ABORT => Operation::CoapAbort,
      | _ => return Err(ParseError::Malformed),
    },
    | CodeKind::Request => match code {
      | Code::GET => match (f.observe, f.named) {
        | (_, NamedPath::Bspack) => Operation::BootstrapPackReq,
        | (_, named) if named != NamedPath::None => return Err(ParseError::Malformed),
        | (Some(0), _) => Operation::InfObserve,
        | (Some(1), _) => Operation::InfCancelObserve,
        | (Some(_), _) => return Err(ParseError::Malformed),
        | (None, _) if f.accept == Some(ContentFormat::LINK_FORMAT) => Operation::DmDiscover,
        | (None, _) => Operation::DmRead,
      },
      | Code::FETCH => match f.observe {
        | Some(0) => Operation::InfObserveComp,
        | Some(1) => Operation::InfCancelObserveComp,
        | Some(_) => return Err(ParseError::Malformed),
        | None => Operation::DmReadComp,
      },
      | Code::POST => match f.named {
        | NamedPath::Bs => {
          if f.query.iter().any(|q| q.starts_with("ep=")) {
            Operation::BootstrapReq
          } else {
            Operation::BootstrapFinish
          }
        },
        | NamedPath::Dp => match ty {
          | Some(Type::Non) => Operation::InfNonConSend,
          | _ => Operation::InfConSend,
        },
        | NamedPath::Rd if f.named_segments.len() == 1 => Operation::Register,
        | NamedPath::Bspack => return Err(ParseError::Malformed),
        | NamedPath::None => match f.uri.len() {
          | 0 => return Err(ParseError::Malformed),
          | 1 => Operation::DmCreate,
          | 2 => Operation::DmWritePartial,
          | _ if f.content_format.is_some() => Operation::DmWritePartial,
          | _ => Operation::DmExecute,
        },
        | _ => Operation::Update,
      },
      | Code::PUT if f.named != NamedPath::None => return Err(ParseError::Malformed),
      | Code::PUT => {
        if f.payload.is_empty() && NotificationAttrs::query_mentions_any(&f.query) {
          Operation::DmWriteAttr
        } else {
          Operation::DmWriteReplace
        }
      },
      | Code::IPATCH | Code::PATCH => Operation::DmWriteComp,
      | Code::DELETE => match f.named {
        | NamedPath::None => Operation::DmDelete,
        | NamedPath::Bs | NamedPath::Bspack | NamedPath::Dp => {
          return Err(ParseError::Malformed)
        },
        | _ => Operation::Deregister,
      },
      | _ => return Err(ParseError::Malformed),
    },
  })
}

fn attrs_for<'a>(op: Operation, f: &Fields<'a>) -> Result<Attrs<'a>, ParseError> {
  Ok(match op {
    | Operation::InfObserve | Operation::InfObserveComp | Operation::DmWriteAttr => {
      Attrs::Notification(NotificationAttrs::from_query(&f.query)?)
    },
    | Operation::DmDiscover => Attrs::Discover(DiscoverAttrs::from_query(&f.query)?),
    | Operation::Register | Operation::Update => {
      Attrs::Register(RegisterAttrs::from_query(&f.query)?)
    },
    | Operation::BootstrapReq | Operation::BootstrapPackReq => {
      Attrs::Bootstrap(BootstrapAttrs::from_query(&f.query)?)
    },
    | _ => Attrs::None,
  })
}

fn decode_signalling(mut reader: OptReader<'_>, code: Code) -> Result<Signalling, ParseError> {
  let mut max_msg_size = 1152u32;
  let mut block_wise = false;
  let mut custody = false;

  while let Some(o) = reader.next_opt()? {
    match (code, o.number) {
      | (Code::CSM, opt::CSM_MAX_MESSAGE_SIZE) => max_msg_size = uint_opt(o.value, 4)?,
      | (Code::CSM, opt::CSM_BLOCK_WISE_TRANSFER) => block_wise = true,
      | (Code::PING, opt::PING_CUSTODY) | (Code::PONG, opt::PING_CUSTODY) => custody = true,
      | (_, n) if opt::is_critical(n) => return Err(ParseError::OptionUnsupported(n)),
      | _ => {},
    }
  }

  Ok(match code {
    | Code::CSM => Signalling::Csm { max_msg_size, block_wise },
    | Code::PING => Signalling::Ping { custody },
    | Code::PONG => Signalling::Pong { custody },
    | _ => Signalling::None,
  })
}

/// Shared tail of both decoders: everything after the transport header
/// and token.
pub(crate) fn decode_rest<'a>(code: Code,
                              token: Token,
                              binding: Binding,
                              cursor: Cursor<'a>)
                              -> Result<Message<'a>, ParseError> {
  if code.kind() == CodeKind::Signalling {
    let signalling = decode_signalling(OptReader::new(cursor), code)?;
    let operation = classify(code,
                             binding,
                             &decode_fields(OptReader::new(Cursor::new(&[])))?)?;
    return Ok(Message { operation,
                        code,
                        token,
                        binding,
                        signalling,
                        ..Message::default() });
  }

  let f = decode_fields(OptReader::new(cursor))?;
  let operation = classify(code, binding, &f)?;
  let attrs = attrs_for(operation, &f)?;

  // a payload needs a declared media type
  if !f.payload.is_empty() && f.content_format.is_none() {
    return Err(ParseError::Malformed);
  }

  // when both block options appear (composite responses), Block2 drives
  // the continuing direction; Block1 merely closes the incoming body
  let block = match (f.block1, f.block2) {
    | (Some(_), Some(b2)) => Some(Block { kind: BlockKind::Both, ..b2 }),
    | (Some(b1), None) => Some(b1),
    | (None, Some(b2)) => Some(b2),
    | (None, None) => None,
  };

  let location_path = match operation {
    | Operation::Update | Operation::Deregister => LocationPath { segments: f.named_segments },
    | _ => LocationPath { segments: f.location },
  };

  Ok(Message { operation,
               code,
               token,
               uri: f.uri,
               content_format: f.content_format,
               accept: f.accept,
               observe: f.observe,
               block,
               etag: f.etag,
               location_path,
               attrs,
               payload: f.payload,
               binding,
               signalling: Signalling::None })
}

fn u16_segment(v: u16) -> (usize, [u8; 5]) {
  let mut buf = [0u8; 5];
  let mut n = v;
  let mut digits = 0usize;
  loop {
    buf[4 - digits] = b'0' + (n % 10) as u8;
    digits += 1;
    n /= 10;
    if n == 0 {
      break;
    }
  }
  buf.copy_within(5 - digits..5, 0);
  (digits, buf)
}

/// Shared tail of both encoders: options + payload, starting at `pos`.
/// Returns the total length written.
pub(crate) fn encode_rest(msg: &Message<'_>,
                          out: &mut [u8],
                          pos: usize)
                          -> Result<usize, EncodeError> {
  msg.check()?;
  let mut w = OptWriter::new(out, pos);

  if let Signalling::Csm { max_msg_size, block_wise } = msg.signalling {
    w.option_uint(opt::CSM_MAX_MESSAGE_SIZE, max_msg_size)?;
    if block_wise {
      w.option(opt::CSM_BLOCK_WISE_TRANSFER, &[])?;
    }
    return w.payload(msg.payload);
  }
  if let Signalling::Ping { custody } | Signalling::Pong { custody } = msg.signalling {
    if custody {
      w.option(opt::PING_CUSTODY, &[])?;
    }
    return w.payload(msg.payload);
  }

  if !msg.etag.is_empty() {
    w.option(opt::ETAG, msg.etag.as_bytes())?;
  }

  if let Some(observe) = msg.observe {
    if observe > 0x00FF_FFFF {
      return Err(EncodeError::InvalidMessage);
    }
    w.option_uint(opt::OBSERVE, observe)?;
  }

  let named_uri = match msg.operation {
    | Operation::Register => Some("rd"),
    | Operation::BootstrapReq | Operation::BootstrapFinish => Some("bs"),
    | Operation::BootstrapPackReq => Some("bspack"),
    | Operation::InfConSend | Operation::InfNonConSend => Some("dp"),
    | _ => None,
  };

  let uri_from_location =
    matches!(msg.operation, Operation::Update | Operation::Deregister);

  if !uri_from_location {
    // Location-Path: response-side (register / create acks)
    if let Attrs::CreateAck(c) = msg.attrs {
      let (n, buf) = u16_segment(c.oid);
      w.option(opt::LOCATION_PATH, &buf[..n])?;
      let (n, buf) = u16_segment(c.iid);
      w.option(opt::LOCATION_PATH, &buf[..n])?;
    } else {
      for seg in msg.location_path.segments.iter() {
        w.option(opt::LOCATION_PATH, seg.as_bytes())?;
      }
    }
  }

  if let Some(named) = named_uri {
    w.option(opt::URI_PATH, named.as_bytes())?;
  } else if uri_from_location {
    for seg in msg.location_path.segments.iter() {
      w.option(opt::URI_PATH, seg.as_bytes())?;
    }
  } else {
    for id in msg.uri.ids() {
      let (n, buf) = u16_segment(*id);
      w.option(opt::URI_PATH, &buf[..n])?;
    }
  }

  if let Some(ContentFormat(cf)) = msg.content_format {
    w.option_uint(opt::CONTENT_FORMAT, cf as u32)?;
  }

  {
    let w = &mut w;
    let mut emit = |item: &str| w.option(opt::URI_QUERY, item.as_bytes());
    match &msg.attrs {
      | Attrs::Notification(a) => a.for_each_item(&mut emit)?,
      | Attrs::Register(a) => a.for_each_item(&mut emit)?,
      | Attrs::Bootstrap(a) => a.for_each_item(&mut emit)?,
      | Attrs::Discover(a) => {
        if let crate::attr::Presence::Value(d) = a.depth {
          let mut buf = [0u8; 16];
          let (n, digits) = u16_segment(d as u16);
          buf[..6].copy_from_slice(b"depth=");
          buf[6..6 + n].copy_from_slice(&digits[..n]);
          let s = core::str::from_utf8(&buf[..6 + n]).unwrap_or("depth=0");
          emit(s)?;
        }
      },
      | Attrs::None | Attrs::CreateAck(_) => {},
    }
  }

  if let Some(ContentFormat(a)) = msg.accept {
    w.option_uint(opt::ACCEPT, a as u32)?;
  }

  if let Some(b) = msg.block {
    match b.kind {
      | BlockKind::B1 => w.option_uint(opt::BLOCK1, b.to_raw().map_err(|_| EncodeError::InvalidMessage)?)?,
      | BlockKind::B2 => w.option_uint(opt::BLOCK2, b.to_raw().map_err(|_| EncodeError::InvalidMessage)?)?,
      | BlockKind::Both => {
        let b2 = Block::new(BlockKind::B2, 0, b.size, true);
        let b1 = Block::new(BlockKind::B1, b.number, b.size, false);
        w.option_uint(opt::BLOCK2, b2.to_raw().map_err(|_| EncodeError::InvalidMessage)?)?;
        w.option_uint(opt::BLOCK1, b1.to_raw().map_err(|_| EncodeError::InvalidMessage)?)?;
      },
    }
  }

  w.payload(msg.payload)
}
