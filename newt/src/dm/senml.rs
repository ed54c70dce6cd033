//! SenML JSON (RFC 8428) in the shape LwM2M uses it: records keyed by
//! `n` (full path) or `bn`+`n`, values in `v` / `vb` / `vs` / `vd` /
//! `vlo`. The encoder emits one record per data-model entry; the decoder
//! accepts the strict subset LwM2M servers produce and nothing more.

use core::fmt::Write as _;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use newt_msg::{Code, UriPath};
use std_alloc::string::String;
use std_alloc::vec::Vec;

use super::{Chunk, Value};

/// An owned decoded record value.
#[derive(Clone, Debug, PartialEq)]
pub enum SenmlValue {
  /// `v`
  Num(f64),
  /// `vb`
  Bool(bool),
  /// `vs`
  Str(String),
  /// `vd` (base64url)
  Opaque(Vec<u8>),
  /// `vlo` (`"oid:iid"`)
  Objlnk(u16, u16),
  /// Record with no value field (path-only, e.g. read-composite
  /// selectors)
  None,
}

impl SenmlValue {
  /// Borrow as a data-model [`Value`].
  pub fn borrow(&self) -> Value<'_> {
    match self {
      | SenmlValue::Num(v) => Value::Double(*v),
      | SenmlValue::Bool(b) => Value::Bool(*b),
      | SenmlValue::Str(s) => Value::Str(Chunk::whole(s.as_bytes())),
      | SenmlValue::Opaque(b) => Value::Bytes(Chunk::whole(b)),
      | SenmlValue::Objlnk(o, i) => Value::Objlnk { oid: *o, iid: *i },
      | SenmlValue::None => Value::Null,
    }
  }
}

/// Append one record for `(path, value)` to the document under
/// construction.
pub fn encode_entry(doc: &mut String, path: &UriPath, value: &Value<'_>) {
  if doc.is_empty() {
    doc.push('[');
  } else {
    doc.pop(); // trailing ']'
    doc.push(',');
  }

  let _ = write!(doc, "{{\"n\":\"{}\"", path);
  match value {
    | Value::Int(v) => {
      let _ = write!(doc, ",\"v\":{}", v);
    },
    | Value::Uint(v) => {
      let _ = write!(doc, ",\"v\":{}", v);
    },
    | Value::Time(v) => {
      let _ = write!(doc, ",\"v\":{}", v);
    },
    | Value::Double(v) => {
      if v.is_finite() {
        let _ = write!(doc, ",\"v\":{}", v);
      }
    },
    | Value::Bool(b) => {
      let _ = write!(doc, ",\"vb\":{}", b);
    },
    | Value::Str(c) => {
      doc.push_str(",\"vs\":\"");
      escape_into(doc, c.data);
      doc.push('"');
    },
    | Value::Bytes(c) => {
      let _ = write!(doc, ",\"vd\":\"{}\"", URL_SAFE_NO_PAD.encode(c.data));
    },
    | Value::Objlnk { oid, iid } => {
      let _ = write!(doc, ",\"vlo\":\"{}:{}\"", oid, iid);
    },
    | Value::Null => {},
  }
  doc.push('}');
  doc.push(']');
}

fn escape_into(doc: &mut String, bytes: &[u8]) {
  for b in bytes {
    match b {
      | b'"' => doc.push_str("\\\""),
      | b'\\' => doc.push_str("\\\\"),
      | 0x08 => doc.push_str("\\b"),
      | 0x0C => doc.push_str("\\f"),
      | b'\n' => doc.push_str("\\n"),
      | b'\r' => doc.push_str("\\r"),
      | b'\t' => doc.push_str("\\t"),
      | b if *b < 0x20 => {
        let _ = write!(doc, "\\u{:04x}", b);
      },
      | b => doc.push(*b as char),
    }
  }
}

/// Parse a SenML JSON document into `(path, value)` records.
pub fn decode(payload: &[u8]) -> Result<Vec<(UriPath, SenmlValue)>, Code> {
  let text = core::str::from_utf8(payload).map_err(|_| Code::BAD_REQUEST)?;
  let mut p = Parser { bytes: text.as_bytes(), pos: 0 };

  p.skip_ws();
  p.expect(b'[')?;
  let mut records = Vec::new();
  let mut base = String::new();

  p.skip_ws();
  if p.peek() == Some(b']') {
    p.pos += 1;
    return Ok(records);
  }

  loop {
    records.push(p.record(&mut base)?);
    p.skip_ws();
    match p.next()? {
      | b',' => continue,
      | b']' => break,
      | _ => return Err(Code::BAD_REQUEST),
    }
  }

  Ok(records)
}

struct Parser<'a> {
  bytes: &'a [u8],
  pos: usize,
}

impl<'a> Parser<'a> {
  fn peek(&self) -> Option<u8> {
    self.bytes.get(self.pos).copied()
  }

  fn next(&mut self) -> Result<u8, Code> {
    let b = self.peek().ok_or(Code::BAD_REQUEST)?;
    self.pos += 1;
    Ok(b)
  }

  fn expect(&mut self, b: u8) -> Result<(), Code> {
    if self.next()? == b {
      Ok(())
    } else {
      Err(Code::BAD_REQUEST)
    }
  }

  fn skip_ws(&mut self) {
    while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
      self.pos += 1;
    }
  }

  fn string(&mut self) -> Result<String, Code> {
    self.expect(b'"')?;
    let mut out = String::new();
    loop {
      match self.next()? {
        | b'"' => return Ok(out),
        | b'\\' => match self.next()? {
          | b'"' => out.push('"'),
          | b'\\' => out.push('\\'),
          | b'/' => out.push('/'),
          | b'b' => out.push('\u{8}'),
          | b'f' => out.push('\u{c}'),
          | b'n' => out.push('\n'),
          | b'r' => out.push('\r'),
          | b't' => out.push('\t'),
          | _ => return Err(Code::BAD_REQUEST),
        },
        | b => out.push(b as char),
      }
    }
  }

  fn number(&mut self) -> Result<f64, Code> {
    let start = self.pos;
    while matches!(self.peek(),
                   Some(b'-') | Some(b'+') | Some(b'.') | Some(b'e') | Some(b'E')
                   | Some(b'0'..=b'9'))
    {
      self.pos += 1;
    }

    core::str::from_utf8(&self.bytes[start..self.pos]).ok()
                                                      .and_then(|s| s.parse::<f64>().ok())
                                                      .ok_or(Code::BAD_REQUEST)
  }

  fn literal(&mut self, lit: &str) -> Result<(), Code> {
    if self.bytes[self.pos..].starts_with(lit.as_bytes()) {
      self.pos += lit.len();
      Ok(())
    } else {
      Err(Code::BAD_REQUEST)
    }
  }

  fn record(&mut self, base: &mut String) -> Result<(UriPath, SenmlValue), Code> {
    self.skip_ws();
    self.expect(b'{')?;

    let mut name = String::new();
    let mut value = SenmlValue::None;

    self.skip_ws();
    if self.peek() == Some(b'}') {
      self.pos += 1;
      return Err(Code::BAD_REQUEST);
    }

    loop {
      self.skip_ws();
      let key = self.string()?;
      self.skip_ws();
      self.expect(b':')?;
      self.skip_ws();

      match key.as_str() {
        | "bn" => *base = self.string()?,
        | "n" => name = self.string()?,
        | "v" => value = SenmlValue::Num(self.number()?),
        | "vb" => {
          value = match self.peek() {
            | Some(b't') => {
              self.literal("true")?;
              SenmlValue::Bool(true)
            },
            | _ => {
              self.literal("false")?;
              SenmlValue::Bool(false)
            },
          }
        },
        | "vs" => value = SenmlValue::Str(self.string()?),
        | "vd" => {
          let s = self.string()?;
          let bytes = URL_SAFE_NO_PAD.decode(s.as_bytes())
                                     .or_else(|_| STANDARD.decode(s.as_bytes()))
                                     .map_err(|_| Code::BAD_REQUEST)?;
          value = SenmlValue::Opaque(bytes);
        },
        | "vlo" => {
          let s = self.string()?;
          let (o, i) = s.split_once(':').ok_or(Code::BAD_REQUEST)?;
          value = SenmlValue::Objlnk(o.parse().map_err(|_| Code::BAD_REQUEST)?,
                                     i.parse().map_err(|_| Code::BAD_REQUEST)?);
        },
        | "t" | "bt" => {
          // timestamps accepted and ignored
          let _ = self.number()?;
        },
        | _ => return Err(Code::BAD_REQUEST),
      }

      self.skip_ws();
      match self.next()? {
        | b',' => continue,
        | b'}' => break,
        | _ => return Err(Code::BAD_REQUEST),
      }
    }

    // the record name is always the concatenation of base name and name
    let full = if base.is_empty() {
      name
    } else {
      let mut joined = base.clone();
      joined.push_str(&name);
      joined
    };

    Ok((parse_path(&full)?, value))
  }
}

pub(crate) fn parse_path(s: &str) -> Result<UriPath, Code> {
  let trimmed = s.strip_prefix('/').ok_or(Code::BAD_REQUEST)?;
  if trimmed.is_empty() {
    return Ok(UriPath::root());
  }

  let mut ids = [0u16; 4];
  let mut n = 0usize;
  for seg in trimmed.split('/') {
    if n == 4 || seg.is_empty() {
      return Err(Code::BAD_REQUEST);
    }
    ids[n] = seg.parse::<u16>().map_err(|_| Code::BAD_REQUEST)?;
    n += 1;
  }

  UriPath::from_ids(&ids[..n]).map_err(|_| Code::BAD_REQUEST)
}

#[cfg(test)]
mod tests {
  use std_alloc::vec;

  use super::*;

  #[test]
  fn encode_scalars() {
    let mut doc = String::new();
    encode_entry(&mut doc, &UriPath::resource(3, 0, 9), &Value::Int(87));
    assert_eq!(doc, r#"[{"n":"/3/0/9","v":87}]"#);

    encode_entry(&mut doc, &UriPath::resource(3, 0, 13), &Value::Bool(true));
    assert_eq!(doc, r#"[{"n":"/3/0/9","v":87},{"n":"/3/0/13","vb":true}]"#);
  }

  #[test]
  fn encode_string_escaped() {
    let mut doc = String::new();
    encode_entry(&mut doc,
                 &UriPath::resource(3, 0, 1),
                 &Value::Str(Chunk::whole(b"a\"b\\c")));
    assert_eq!(doc, r#"[{"n":"/3/0/1","vs":"a\"b\\c"}]"#);
  }

  #[test]
  fn encode_opaque_base64() {
    let mut doc = String::new();
    encode_entry(&mut doc,
                 &UriPath::resource(5, 0, 0),
                 &Value::Bytes(Chunk::whole(&[0xDE, 0xAD, 0xBE, 0xEF])));
    assert_eq!(doc, r#"[{"n":"/5/0/0","vd":"3q2-7w"}]"#);
  }

  #[test]
  fn decode_records() {
    let doc = br#"[{"n":"/1/0/1","v":120},{"n":"/1/0/7","vs":"U"},{"n":"/1/0/6","vb":false}]"#;
    let records = decode(doc).unwrap();
    assert_eq!(records,
               vec![(UriPath::resource(1, 0, 1), SenmlValue::Num(120.0)),
                    (UriPath::resource(1, 0, 7), SenmlValue::Str("U".into())),
                    (UriPath::resource(1, 0, 6), SenmlValue::Bool(false))]);
  }

  #[test]
  fn decode_with_base_name() {
    let doc = br#"[{"bn":"/3/0","n":"/9","v":42},{"n":"/13","v":1}]"#;
    let records = decode(doc).unwrap();
    assert_eq!(records[0].0, UriPath::resource(3, 0, 9));
    assert_eq!(records[1].0, UriPath::resource(3, 0, 13));
  }

  #[test]
  fn decode_path_only_selectors() {
    let doc = br#"[{"n":"/3/0/1"},{"n":"/4"}]"#;
    let records = decode(doc).unwrap();
    assert_eq!(records,
               vec![(UriPath::resource(3, 0, 1), SenmlValue::None),
                    (UriPath::object(4), SenmlValue::None)]);
  }

  #[test]
  fn decode_rejects_junk() {
    assert!(decode(b"{}").is_err());
    assert!(decode(b"[{}]").is_err());
    assert!(decode(br#"[{"n":42}]"#).is_err());
    assert!(decode(br#"[{"n":"/1","v":}]"#).is_err());
    assert!(decode(br#"[{"x":"/1"}]"#).is_err());
    assert!(decode(&[0xFF, 0xFE]).is_err());
  }

  #[test]
  fn round_trip() {
    let mut doc = String::new();
    encode_entry(&mut doc, &UriPath::resource(3303, 0, 5700), &Value::Double(22.5));
    let records = decode(doc.as_bytes()).unwrap();
    assert_eq!(records,
               vec![(UriPath::resource(3303, 0, 5700), SenmlValue::Num(22.5))]);
  }
}
