//! Plain-text payloads for single-resource operations: decimal numbers,
//! `0`/`1` booleans, `oid:iid` object links, raw UTF-8 strings, and
//! base64 opaque values.

use core::fmt::Write as _;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use newt_msg::Code;
use std_alloc::string::String;
use std_alloc::vec::Vec;

use super::{Chunk, DataType, Value};

/// Render `value` as a plain-text body.
pub fn encode(value: &Value<'_>) -> Vec<u8> {
  let mut out = String::new();
  match value {
    | Value::Int(v) => {
      let _ = write!(out, "{}", v);
    },
    | Value::Uint(v) => {
      let _ = write!(out, "{}", v);
    },
    | Value::Time(v) => {
      let _ = write!(out, "{}", v);
    },
    | Value::Double(v) => {
      let _ = write!(out, "{}", v);
    },
    | Value::Bool(b) => out.push(if *b { '1' } else { '0' }),
    | Value::Objlnk { oid, iid } => {
      let _ = write!(out, "{}:{}", oid, iid);
    },
    | Value::Str(c) => return c.data.to_vec(),
    | Value::Bytes(c) => return STANDARD.encode(c.data).into_bytes(),
    | Value::Null => {},
  }
  out.into_bytes()
}

/// Parse a complete plain-text body as a value of the declared type.
///
/// Chunked bytes / strings do not pass through here — the dispatcher
/// streams those to the handler directly.
pub fn decode(payload: &[u8], typ: DataType) -> Result<OwnedText, Code> {
  let s = core::str::from_utf8(payload).map_err(|_| Code::BAD_REQUEST)?;

  Ok(match typ {
    | DataType::Int => OwnedText::Int(s.parse::<i64>().map_err(|_| Code::BAD_REQUEST)?),
    | DataType::Time => OwnedText::Time(s.parse::<i64>().map_err(|_| Code::BAD_REQUEST)?),
    | DataType::Uint => OwnedText::Uint(s.parse::<u64>().map_err(|_| Code::BAD_REQUEST)?),
    | DataType::Double => OwnedText::Double(s.parse::<f64>().map_err(|_| Code::BAD_REQUEST)?),
    | DataType::Bool => match s {
      | "0" => OwnedText::Bool(false),
      | "1" => OwnedText::Bool(true),
      | _ => return Err(Code::BAD_REQUEST),
    },
    | DataType::Objlnk => {
      let (o, i) = s.split_once(':').ok_or(Code::BAD_REQUEST)?;
      OwnedText::Objlnk(o.parse().map_err(|_| Code::BAD_REQUEST)?,
                        i.parse().map_err(|_| Code::BAD_REQUEST)?)
    },
    | DataType::Bytes => {
      OwnedText::Bytes(STANDARD.decode(payload).map_err(|_| Code::BAD_REQUEST)?)
    },
    | DataType::Str | DataType::None => OwnedText::Str(String::from(s)),
  })
}

/// An owned value decoded from text, borrowable as [`Value`].
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum OwnedText {
  Int(i64),
  Uint(u64),
  Double(f64),
  Bool(bool),
  Time(i64),
  Objlnk(u16, u16),
  Str(String),
  Bytes(Vec<u8>),
}

impl OwnedText {
  /// Borrow as a data-model [`Value`].
  pub fn borrow(&self) -> Value<'_> {
    match self {
      | OwnedText::Int(v) => Value::Int(*v),
      | OwnedText::Uint(v) => Value::Uint(*v),
      | OwnedText::Double(v) => Value::Double(*v),
      | OwnedText::Bool(b) => Value::Bool(*b),
      | OwnedText::Time(v) => Value::Time(*v),
      | OwnedText::Objlnk(o, i) => Value::Objlnk { oid: *o, iid: *i },
      | OwnedText::Str(s) => Value::Str(Chunk::whole(s.as_bytes())),
      | OwnedText::Bytes(b) => Value::Bytes(Chunk::whole(b)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalars() {
    assert_eq!(encode(&Value::Int(-7)), b"-7".to_vec());
    assert_eq!(encode(&Value::Uint(42)), b"42".to_vec());
    assert_eq!(encode(&Value::Bool(true)), b"1".to_vec());
    assert_eq!(encode(&Value::Double(22.5)), b"22.5".to_vec());
    assert_eq!(encode(&Value::Objlnk { oid: 3, iid: 0 }), b"3:0".to_vec());

    assert_eq!(decode(b"-7", DataType::Int), Ok(OwnedText::Int(-7)));
    assert_eq!(decode(b"1", DataType::Bool), Ok(OwnedText::Bool(true)));
    assert_eq!(decode(b"2", DataType::Bool), Err(Code::BAD_REQUEST));
    assert_eq!(decode(b"3:0", DataType::Objlnk), Ok(OwnedText::Objlnk(3, 0)));
    assert_eq!(decode(b"x", DataType::Double), Err(Code::BAD_REQUEST));
  }

  #[test]
  fn opaque_is_base64() {
    assert_eq!(encode(&Value::Bytes(Chunk::whole(&[0xDE, 0xAD]))),
               b"3q0=".to_vec());
    assert_eq!(decode(b"3q0=", DataType::Bytes),
               Ok(OwnedText::Bytes(vec![0xDE, 0xAD])));
  }
}
