use crate::code::Code;
use crate::cursor::Cursor;
use crate::id::Id;
use crate::msg::{self, Binding, Message};
use crate::parse_error::{EncodeError, ParseError};
use crate::token::Token;
use crate::ty::Type;

/// Decode one CoAP-over-UDP datagram.
///
/// The returned message borrows its payload and strings from `buf`.
pub fn decode_udp(buf: &[u8]) -> Result<Message<'_>, ParseError> {
  let mut cursor = Cursor::new(buf);

  let byte1 = cursor.next().ok_or_else(ParseError::eof)?;
  let ver = byte1 >> 6;
  if ver != 1 {
    return Err(ParseError::Malformed);
  }

  let ty = Type::try_from((byte1 >> 4) & 0b11)?;
  let tkl = byte1 & 0b1111;
  if tkl > 8 {
    return Err(ParseError::InvalidTokenLength(tkl));
  }

  let code = Code::from(cursor.next().ok_or_else(ParseError::eof)?);
  let id = Id(cursor.take_uint(2).ok_or_else(ParseError::eof)? as u16);
  let token = Token::from_bytes(cursor.take_exact(tkl as usize).ok_or_else(ParseError::eof)?)?;

  msg::decode_rest(code, token, Binding::Udp { id, ty }, cursor)
}

/// Encode one CoAP-over-UDP datagram into `out`, returning the number of
/// bytes written. Refuses with [`EncodeError::BufTooSmall`] when the
/// complete message does not fit — nothing is truncated.
pub fn encode_udp(msg: &Message<'_>, out: &mut [u8]) -> Result<usize, EncodeError> {
  let (id, ty) = match msg.binding {
    | Binding::Udp { id, ty } => (id, ty),
    | Binding::Tcp => return Err(EncodeError::InvalidMessage),
  };

  let tkl = msg.token.len();
  let header = 4 + tkl;
  if out.len() < header {
    return Err(EncodeError::BufTooSmall);
  }

  out[0] = (1 << 6) | (ty.bits() << 4) | tkl as u8;
  out[1] = msg.code.into();
  out[2..4].copy_from_slice(&id.0.to_be_bytes());
  out[4..header].copy_from_slice(msg.token.as_bytes());

  msg::encode_rest(msg, out, header)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::attr::{Attrs, Presence};
  use crate::block::{Block, BlockKind};
  use crate::content_format::ContentFormat;
  use crate::op::Operation;
  use crate::path::UriPath;

  fn tok(bytes: &[u8]) -> Token {
    Token::from_bytes(bytes).unwrap()
  }

  #[test]
  fn decode_read() {
    let msg_bytes = b"\x44\x01\x21\x37\x12\x34\x56\x78\xB1\x33\x01\x33\x02\x31\x31\x02\x31\x31\x62\x01\x40";

    let msg = decode_udp(msg_bytes).unwrap();
    assert_eq!(msg.operation, Operation::DmRead);
    assert_eq!(msg.uri, UriPath::resource_instance(3, 3, 11, 11));
    assert_eq!(msg.accept, Some(ContentFormat::SENML_ETCH_JSON));
    assert_eq!(msg.content_format, None);
    assert_eq!(msg.msg_id(), Some(Id(0x2137)));
    assert_eq!(msg.token, tok(&[0x12, 0x34, 0x56, 0x78]));
    assert!(msg.payload.is_empty());
  }

  #[test]
  fn decode_write_replace() {
    let msg_bytes = b"\x48\x03\x37\x21\x12\x34\x56\x78\x11\x11\x11\x11\xB1\x35\x01\x30\x01\x31\x10\xFF\x33\x44\x55";

    let msg = decode_udp(msg_bytes).unwrap();
    assert_eq!(msg.operation, Operation::DmWriteReplace);
    assert_eq!(msg.uri, UriPath::resource(5, 0, 1));
    assert_eq!(msg.content_format, Some(ContentFormat::PLAIN_TEXT));
    assert_eq!(msg.msg_id(), Some(Id(0x3721)));
    assert_eq!(msg.payload, &[0x33, 0x44, 0x55]);
    // zero-copy: payload points into the input
    assert_eq!(msg.payload.as_ptr(), msg_bytes[20..].as_ptr());
  }

  #[test]
  fn decode_write_replace_with_block() {
    let msg_bytes = b"\x48\x03\x37\x21\x12\x34\x56\x78\x11\x11\x11\x11\xB1\x35\x01\x30\x01\x31\x10\xD1\x02\xEE\xFF\x33\x44\x55";

    let msg = decode_udp(msg_bytes).unwrap();
    assert_eq!(msg.operation, Operation::DmWriteReplace);
    assert_eq!(msg.block,
               Some(Block { kind: BlockKind::B1,
                            number: 14,
                            size: 1024,
                            more: true }));
  }

  #[test]
  fn decode_discover() {
    let msg_bytes =
      b"\x48\x01\x37\x21\x12\x34\x56\x78\x11\x11\x11\x11\xB1\x35\x01\x35\x61\x28";

    let msg = decode_udp(msg_bytes).unwrap();
    assert_eq!(msg.operation, Operation::DmDiscover);
    assert_eq!(msg.uri, UriPath::instance(5, 5));
    assert_eq!(msg.accept, Some(ContentFormat::LINK_FORMAT));
    match msg.attrs {
      | Attrs::Discover(d) => assert_eq!(d.depth, Presence::Absent),
      | _ => panic!("expected discover attrs"),
    }
  }

  #[test]
  fn decode_observe_with_attrs() {
    // GET /3/0/1 observe=0 pmin=20 pmax=1200
    let mut buf = [0u8; 128];
    let msg = Message { operation: Operation::InfObserve,
                        code: Code::GET,
                        token: tok(&[0x0B, 0x22]),
                        uri: UriPath::resource(3, 0, 1),
                        observe: Some(0),
                        attrs: Attrs::Notification(crate::attr::NotificationAttrs {
                          pmin: Presence::Value(20),
                          pmax: Presence::Value(1200),
                          ..Default::default()
                        }),
                        binding: Binding::Udp { id: Id(0x1234), ty: Type::Con },
                        ..Message::default() };
    let n = encode_udp(&msg, &mut buf).unwrap();

    let decoded = decode_udp(&buf[..n]).unwrap();
    assert_eq!(decoded.operation, Operation::InfObserve);
    assert_eq!(decoded.observe, Some(0));
    let attrs = decoded.attrs.notification().unwrap();
    assert_eq!(attrs.pmin, Presence::Value(20));
    assert_eq!(attrs.pmax, Presence::Value(1200));
  }

  #[test]
  fn cancel_observe_classified() {
    let msg = Message { operation: Operation::InfCancelObserve,
                        code: Code::GET,
                        token: tok(&[1]),
                        uri: UriPath::resource(3, 0, 1),
                        observe: Some(1),
                        binding: Binding::Udp { id: Id(7), ty: Type::Con },
                        ..Message::default() };
    let mut buf = [0u8; 64];
    let n = encode_udp(&msg, &mut buf).unwrap();
    assert_eq!(decode_udp(&buf[..n]).unwrap().operation,
               Operation::InfCancelObserve);
  }

  #[test]
  fn execute_vs_write_partial() {
    // POST /3/0/4, no content-format, no payload => execute
    let exec = b"\x41\x02\x00\x01\xA5\xB1\x33\x01\x30\x01\x34";
    assert_eq!(decode_udp(exec).unwrap().operation, Operation::DmExecute);

    // POST /3/0 with payload => write partial
    let wp = b"\x41\x02\x00\x01\xA5\xB1\x33\x01\x30\x10\xFF\x01";
    assert_eq!(decode_udp(wp).unwrap().operation, Operation::DmWritePartial);

    // POST /3 with payload => create
    let create = b"\x41\x02\x00\x01\xA5\xB1\x33\x10\xFF\x01";
    assert_eq!(decode_udp(create).unwrap().operation, Operation::DmCreate);
  }

  #[test]
  fn write_attr_vs_write_replace() {
    // PUT /3/0/1?pmin=10 without payload => write-attributes
    let mut buf = [0u8; 64];
    let msg = Message { operation: Operation::DmWriteAttr,
                        code: Code::PUT,
                        token: tok(&[2]),
                        uri: UriPath::resource(3, 0, 1),
                        attrs: Attrs::Notification(crate::attr::NotificationAttrs {
                          pmin: Presence::Value(10),
                          ..Default::default()
                        }),
                        binding: Binding::Udp { id: Id(9), ty: Type::Con },
                        ..Message::default() };
    let n = encode_udp(&msg, &mut buf).unwrap();
    assert_eq!(decode_udp(&buf[..n]).unwrap().operation, Operation::DmWriteAttr);
  }

  #[test]
  fn register_round_trip() {
    let mut buf = [0u8; 128];
    let payload = b"</1/0>,</3/0>";
    let msg = Message { operation: Operation::Register,
                        code: Code::POST,
                        token: tok(&[0xAA, 0xBB]),
                        content_format: Some(ContentFormat::LINK_FORMAT),
                        attrs: Attrs::Register(crate::attr::RegisterAttrs {
                          endpoint: Some("test-ep"),
                          lifetime: Some(120),
                          lwm2m_ver: Some("1.1"),
                          ..Default::default()
                        }),
                        payload,
                        binding: Binding::Udp { id: Id(0x0101), ty: Type::Con },
                        ..Message::default() };
    let n = encode_udp(&msg, &mut buf).unwrap();

    let decoded = decode_udp(&buf[..n]).unwrap();
    assert_eq!(decoded.operation, Operation::Register);
    assert_eq!(decoded.payload, payload);
    match decoded.attrs {
      | Attrs::Register(r) => {
        assert_eq!(r.endpoint, Some("test-ep"));
        assert_eq!(r.lifetime, Some(120));
        assert_eq!(r.lwm2m_ver, Some("1.1"));
      },
      | _ => panic!("expected register attrs"),
    }
  }

  #[test]
  fn register_response_location_path() {
    // 2.01 Created, Location-Path: rd / 5a3f
    let msg_bytes = b"\x62\x41\x21\x37\x0B\x22\x82\x72\x64\x04\x35\x61\x33\x66";

    let msg = decode_udp(msg_bytes).unwrap();
    assert_eq!(msg.operation, Operation::Response);
    assert_eq!(msg.code, Code::CREATED);
    assert_eq!(msg.msg_type(), Some(Type::Ack));
    assert_eq!(msg.location_path.segments.as_slice(), &["rd", "5a3f"]);
  }

  #[test]
  fn update_encodes_location_as_uri_path() {
    let mut buf = [0u8; 64];
    let msg = Message { operation: Operation::Update,
                        code: Code::POST,
                        token: tok(&[3]),
                        location_path: crate::msg::LocationPath::from_segments(&["rd", "5a3f"]).unwrap(),
                        binding: Binding::Udp { id: Id(4), ty: Type::Con },
                        ..Message::default() };
    let n = encode_udp(&msg, &mut buf).unwrap();

    let decoded = decode_udp(&buf[..n]).unwrap();
    assert_eq!(decoded.operation, Operation::Update);
    assert_eq!(decoded.location_path.segments.as_slice(), &["rd", "5a3f"]);
    assert!(decoded.uri.is_root());
  }

  #[test]
  fn empty_messages() {
    // RST
    let rst = b"\x70\x00\x12\x34";
    let msg = decode_udp(rst).unwrap();
    assert_eq!(msg.operation, Operation::CoapReset);

    // CoAP ping: empty CON
    let ping = b"\x40\x00\x00\x01";
    assert_eq!(decode_udp(ping).unwrap().operation, Operation::CoapPingUdp);

    // empty ACK (separate-response notice)
    let ack = b"\x60\x00\x00\x01";
    assert_eq!(decode_udp(ack).unwrap().operation, Operation::CoapEmptyMsg);
  }

  #[test]
  fn malformed_inputs_do_not_panic() {
    // truncated header
    assert!(decode_udp(&[0x44]).is_err());
    // bad version
    assert!(decode_udp(&[0x04, 0x01, 0, 1]).is_err());
    // tkl 9
    assert!(decode_udp(&[0x49, 0x01, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    // token longer than message
    assert!(decode_udp(&[0x44, 0x01, 0, 1, 0xAA]).is_err());
    // option value runs past the end
    assert!(decode_udp(&[0x40, 0x01, 0, 1, 0xB5, 0x33]).is_err());
    // payload marker with no payload
    assert!(decode_udp(&[0x40, 0x01, 0, 1, 0xFF]).is_err());
    // unknown critical option (numbers 1..=255 walked bytewise)
    assert_eq!(decode_udp(&[0x40, 0x01, 0, 1, 0xD0, 0x18]),
               Err(ParseError::OptionUnsupported(37)));
  }

  #[test]
  fn single_byte_corruption_is_clean() {
    let good = b"\x48\x03\x37\x21\x12\x34\x56\x78\x11\x11\x11\x11\xB1\x35\x01\x30\x01\x31\x10\xFF\x33\x44\x55";

    for ix in 0..good.len() {
      for flip in [0x01u8, 0x80, 0xFF] {
        let mut corrupted = good.to_vec();
        corrupted[ix] ^= flip;
        // must return, not panic; both Ok and Err are acceptable
        let _ = decode_udp(&corrupted);
      }
    }
  }

  #[test]
  fn encode_refuses_small_buffer() {
    let msg = Message { operation: Operation::DmRead,
                        code: Code::GET,
                        token: tok(&[1, 2, 3, 4]),
                        uri: UriPath::resource(3, 0, 9),
                        binding: Binding::Udp { id: Id(1), ty: Type::Con },
                        ..Message::default() };
    let mut buf = [0u8; 8];
    assert_eq!(encode_udp(&msg, &mut buf), Err(EncodeError::BufTooSmall));
  }

  #[test]
  fn payload_without_content_format_rejected() {
    let msg = Message { operation: Operation::DmWriteReplace,
                        code: Code::PUT,
                        token: tok(&[1]),
                        uri: UriPath::resource(3, 0, 9),
                        payload: b"x",
                        binding: Binding::Udp { id: Id(1), ty: Type::Con },
                        ..Message::default() };
    let mut buf = [0u8; 64];
    assert_eq!(encode_udp(&msg, &mut buf), Err(EncodeError::InvalidMessage));
  }
}
