/// A CoRE Content-Format id (the LwM2M-relevant subset).
///
/// `Option<ContentFormat>` stands in for the wire-level "not defined"
/// sentinel: a message with a payload must carry `Some(_)`.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
  /// text/plain;charset=utf-8 (0)
  pub const PLAIN_TEXT: Self = Self(0);
  /// application/link-format (40)
  pub const LINK_FORMAT: Self = Self(40);
  /// application/octet-stream (42)
  pub const OPAQUE: Self = Self(42);
  /// application/cbor (60)
  pub const CBOR: Self = Self(60);
  /// application/senml+json (110)
  pub const SENML_JSON: Self = Self(110);
  /// application/senml+cbor (112)
  pub const SENML_CBOR: Self = Self(112);
  /// application/senml-etch+json (320)
  pub const SENML_ETCH_JSON: Self = Self(320);
  /// application/senml-etch+cbor (322)
  pub const SENML_ETCH_CBOR: Self = Self(322);
  /// application/vnd.oma.lwm2m+tlv (11542)
  pub const LWM2M_TLV: Self = Self(11542);
  /// application/vnd.oma.lwm2m+json (11543)
  pub const LWM2M_JSON: Self = Self(11543);
  /// application/vnd.oma.lwm2m+cbor (11544)
  pub const LWM2M_CBOR: Self = Self(11544);
}

impl From<u16> for ContentFormat {
  fn from(v: u16) -> Self {
    Self(v)
  }
}

impl From<ContentFormat> for u16 {
  fn from(f: ContentFormat) -> u16 {
    f.0
  }
}
