use crate::code::Code;
use crate::cursor::Cursor;
use crate::msg::{self, Binding, Message};
use crate::parse_error::{EncodeError, ParseError};
use crate::token::Token;

/// Outcome of one [`decode_tcp`] call over a (possibly partial, possibly
/// concatenated) stream buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TcpStep<'a> {
  /// One complete message was framed out of the buffer.
  Msg {
    /// The decoded message
    msg: Message<'a>,
    /// Bytes consumed; the next message (if any) starts here
    consumed: usize,
    /// Whether bytes beyond `consumed` are present in the buffer
    more_data: bool,
  },
  /// The buffer truncates the message; read more bytes and retry.
  Incomplete,
}

/// Decode one CoAP-over-TCP frame from the front of `buf`.
///
/// For a stream of concatenated messages, call repeatedly, advancing by
/// the returned `consumed` offset; the stream drains exactly, with
/// [`TcpStep::Incomplete`] reported only when the buffer cuts a message
/// short.
pub fn decode_tcp(buf: &[u8]) -> Result<TcpStep<'_>, ParseError> {
  let mut cursor = Cursor::new(buf);

  let byte1 = match cursor.next() {
    | None => return Ok(TcpStep::Incomplete),
    | Some(b) => b,
  };

  let len_nibble = byte1 >> 4;
  let tkl = byte1 & 0b1111;
  if tkl > 8 {
    return Err(ParseError::InvalidTokenLength(tkl));
  }

  let msg_len = match len_nibble {
    | 13 => match cursor.next() {
      | None => return Ok(TcpStep::Incomplete),
      | Some(b) => b as usize + 13,
    },
    | 14 => match cursor.take_uint(2) {
      | None => return Ok(TcpStep::Incomplete),
      | Some(v) => v as usize + 269,
    },
    | 15 => match cursor.take_uint(4) {
      | None => return Ok(TcpStep::Incomplete),
      | Some(v) => v as usize + 65805,
    },
    | n => n as usize,
  };

  let code = match cursor.next() {
    | None => return Ok(TcpStep::Incomplete),
    | Some(b) => Code::from(b),
  };

  let token = match cursor.take_exact(tkl as usize) {
    | None => return Ok(TcpStep::Incomplete),
    | Some(bytes) => Token::from_bytes(bytes)?,
  };

  if cursor.remaining() < msg_len {
    return Ok(TcpStep::Incomplete);
  }

  let consumed = cursor.position() + msg_len;
  let body = Cursor::new(&buf[cursor.position()..consumed]);
  let msg = msg::decode_rest(code, token, Binding::Tcp, body)?;

  Ok(TcpStep::Msg { msg,
                    consumed,
                    more_data: consumed < buf.len() })
}

/// Encode one CoAP-over-TCP frame into `out`, returning the number of
/// bytes written. Refuses with [`EncodeError::BufTooSmall`] when the
/// complete message does not fit.
pub fn encode_tcp(msg: &Message<'_>, out: &mut [u8]) -> Result<usize, EncodeError> {
  let tkl = msg.token.len();

  // worst-case header: len/tkl byte + 4 extended-length bytes
  let reserve = 1 + 4 + 1 + tkl;
  if out.len() < reserve {
    return Err(EncodeError::BufTooSmall);
  }

  let body_end = msg::encode_rest(msg, out, reserve)?;
  let msg_len = body_end - reserve;

  let (len_nibble, ext): (u8, &[u8]) = match msg_len {
    | 0..=12 => (msg_len as u8, &[]),
    | 13..=268 => (13, &[(msg_len - 13) as u8]),
    | 269..=65804 => {
      let bytes = ((msg_len - 269) as u16).to_be_bytes();
      // two-byte extension lives on the stack of this match arm; copy out
      return finish(out, msg, 14, &bytes, reserve, body_end, tkl);
    },
    | _ => {
      let bytes = ((msg_len - 65805) as u32).to_be_bytes();
      return finish(out, msg, 15, &bytes, reserve, body_end, tkl);
    },
  };

  finish(out, msg, len_nibble, ext, reserve, body_end, tkl)
}

fn finish(out: &mut [u8],
          msg: &Message<'_>,
          len_nibble: u8,
          ext: &[u8],
          reserve: usize,
          body_end: usize,
          tkl: usize)
          -> Result<usize, EncodeError> {
  let ext_buf: [u8; 4] = {
    let mut b = [0u8; 4];
    b[..ext.len()].copy_from_slice(ext);
    b
  };
  let ext_len = ext.len();

  let header_len = 1 + ext_len + 1 + tkl;
  let start = reserve - header_len;

  out[start] = (len_nibble << 4) | tkl as u8;
  out[start + 1..start + 1 + ext_len].copy_from_slice(&ext_buf[..ext_len]);
  out[start + 1 + ext_len] = msg.code.into();
  out[start + 2 + ext_len..start + 2 + ext_len + tkl].copy_from_slice(msg.token.as_bytes());

  if start > 0 {
    out.copy_within(start..body_end, 0);
  }
  Ok(body_end - start)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::content_format::ContentFormat;
  use crate::msg::Signalling;
  use crate::op::Operation;
  use crate::path::UriPath;

  fn tok(bytes: &[u8]) -> Token {
    Token::from_bytes(bytes).unwrap()
  }

  fn expect_msg(step: TcpStep<'_>) -> (Message<'_>, usize, bool) {
    match step {
      | TcpStep::Msg { msg, consumed, more_data } => (msg, consumed, more_data),
      | TcpStep::Incomplete => panic!("unexpected Incomplete"),
    }
  }

  #[test]
  fn decode_write_replace() {
    let bytes = b"\xB8\x03\x12\x34\x56\x78\x11\x11\x11\x11\xB1\x35\x01\x30\x01\x31\x10\xFF\x33\x44\x55";

    let (msg, consumed, more) = expect_msg(decode_tcp(bytes).unwrap());
    assert_eq!(msg.operation, Operation::DmWriteReplace);
    assert_eq!(msg.uri, UriPath::resource(5, 0, 1));
    assert_eq!(msg.content_format, Some(ContentFormat::PLAIN_TEXT));
    assert_eq!(msg.token, tok(&[0x12, 0x34, 0x56, 0x78, 0x11, 0x11, 0x11, 0x11]));
    assert_eq!(msg.payload, &[0x33, 0x44, 0x55]);
    assert_eq!(consumed, bytes.len());
    assert!(!more);
  }

  #[test]
  fn decode_with_extra_bytes() {
    let bytes = b"\xB8\x03\x12\x34\x56\x78\x11\x11\x11\x11\xB1\x35\x01\x30\x01\x31\x10\xFF\x33\x44\x55\xAA\xBB\xCC";

    let (_, consumed, more) = expect_msg(decode_tcp(bytes).unwrap());
    assert_eq!(consumed, bytes.len() - 3);
    assert!(more);
    assert_eq!(&bytes[consumed..], &[0xAA, 0xBB, 0xCC]);
  }

  #[test]
  fn decode_extended_length() {
    // msg_len nibble 13 + extension 0x01 => 14 byte body (includes Block1)
    let bytes = b"\xD8\x01\x03\x12\x34\x56\x78\x11\x11\x11\x11\xB1\x35\x01\x30\x01\x31\x10\xD1\x02\xEE\xFF\x33\x44\x55";

    let (msg, consumed, _) = expect_msg(decode_tcp(bytes).unwrap());
    assert_eq!(msg.operation, Operation::DmWriteReplace);
    let b = msg.block.unwrap();
    assert_eq!((b.number, b.size, b.more), (14, 1024, true));
    assert_eq!(consumed, bytes.len());
  }

  #[test]
  fn incomplete_frames() {
    assert_eq!(decode_tcp(&[]).unwrap(), TcpStep::Incomplete);
    // header promising more than we have
    assert_eq!(decode_tcp(&[0xB8, 0x03, 0x12]).unwrap(), TcpStep::Incomplete);
    let truncated =
      b"\xB8\x03\x12\x34\x56\x78\x11\x11\x11\x11\xB1\x35";
    assert_eq!(decode_tcp(truncated).unwrap(), TcpStep::Incomplete);
  }

  #[test]
  fn stream_drains_exactly() {
    // two frames back to back
    let mut stream = vec![];
    let mut buf = [0u8; 64];

    for (code, rid) in [(Code::GET, 1u16), (Code::GET, 2)] {
      let msg = Message { operation: Operation::DmRead,
                          code,
                          token: tok(&[rid as u8]),
                          uri: UriPath::resource(3, 0, rid),
                          binding: Binding::Tcp,
                          ..Message::default() };
      let n = encode_tcp(&msg, &mut buf).unwrap();
      stream.extend_from_slice(&buf[..n]);
    }

    let (m1, c1, more1) = expect_msg(decode_tcp(&stream).unwrap());
    assert_eq!(m1.uri.rid(), Some(1));
    assert!(more1);

    let (m2, c2, more2) = expect_msg(decode_tcp(&stream[c1..]).unwrap());
    assert_eq!(m2.uri.rid(), Some(2));
    assert!(!more2);
    assert_eq!(c1 + c2, stream.len());
  }

  #[test]
  fn encode_small_body_single_length_byte() {
    let msg = Message { operation: Operation::DmRead,
                        code: Code::GET,
                        token: tok(&[0xAA]),
                        uri: UriPath::object(3),
                        binding: Binding::Tcp,
                        ..Message::default() };
    let mut buf = [0u8; 32];
    let n = encode_tcp(&msg, &mut buf).unwrap();
    // len/tkl, code, token, one uri-path option ("3")
    assert_eq!(&buf[..n], &[0x21, 0x01, 0xAA, 0xB1, 0x33]);
  }

  #[test]
  fn encode_extended_length_round_trip() {
    let payload = [0x5A_u8; 300];
    let msg = Message { operation: Operation::DmWriteReplace,
                        code: Code::PUT,
                        token: tok(&[1, 2]),
                        uri: UriPath::resource(5, 0, 0),
                        content_format: Some(ContentFormat::OPAQUE),
                        payload: &payload,
                        binding: Binding::Tcp,
                        ..Message::default() };
    let mut buf = [0u8; 512];
    let n = encode_tcp(&msg, &mut buf).unwrap();
    // body > 268 bytes => 2-byte extension
    assert_eq!(buf[0] >> 4, 14);

    let (decoded, consumed, _) = expect_msg(decode_tcp(&buf[..n]).unwrap());
    assert_eq!(consumed, n);
    assert_eq!(decoded.payload.len(), 300);
    assert_eq!(decoded.operation, Operation::DmWriteReplace);
  }

  #[test]
  fn csm_round_trip() {
    let msg = Message { operation: Operation::CoapCsm,
                        code: Code::CSM,
                        signalling: Signalling::Csm { max_msg_size: 1152,
                                                      block_wise: true },
                        binding: Binding::Tcp,
                        ..Message::default() };
    let mut buf = [0u8; 32];
    let n = encode_tcp(&msg, &mut buf).unwrap();

    let (decoded, _, _) = expect_msg(decode_tcp(&buf[..n]).unwrap());
    assert_eq!(decoded.operation, Operation::CoapCsm);
    assert_eq!(decoded.signalling,
               Signalling::Csm { max_msg_size: 1152,
                                 block_wise: true });
  }

  #[test]
  fn ping_pong() {
    let ping = Message { operation: Operation::CoapPing,
                         code: Code::PING,
                         signalling: Signalling::Ping { custody: false },
                         binding: Binding::Tcp,
                         ..Message::default() };
    let mut buf = [0u8; 16];
    let n = encode_tcp(&ping, &mut buf).unwrap();
    let (decoded, _, _) = expect_msg(decode_tcp(&buf[..n]).unwrap());
    assert_eq!(decoded.operation, Operation::CoapPing);

    let pong = Message { operation: Operation::CoapPong,
                         code: Code::PONG,
                         signalling: Signalling::Pong { custody: false },
                         binding: Binding::Tcp,
                         ..Message::default() };
    let n = encode_tcp(&pong, &mut buf).unwrap();
    let (decoded, _, _) = expect_msg(decode_tcp(&buf[..n]).unwrap());
    assert_eq!(decoded.operation, Operation::CoapPong);
  }
}
