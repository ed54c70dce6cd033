use core::fmt::{self, Write};

use crate::content_format::ContentFormat;
use crate::parse_error::{EncodeError, ParseError};

/// Longest accepted single query item (`name=value`), in bytes.
pub const ATTR_ITEM_MAX: usize = 64;

/// Most query items one message may carry.
pub const QUERY_ITEMS_MAX: usize = 12;

/// Three-state presence of an attribute in a query string.
///
/// `name=value` sets the attribute; a bare `name` (or `name=`) marks it
/// present-but-unset, which tells the receiver to *clear* its stored value.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub enum Presence<T> {
  /// The attribute did not appear in the query.
  #[default]
  Absent,
  /// The attribute appeared with no value; clear any stored value.
  Unset,
  /// The attribute appeared with this value.
  Value(T),
}

impl<T> Presence<T> {
  /// The carried value, if one is set.
  pub fn value(&self) -> Option<&T> {
    match self {
      | Presence::Value(v) => Some(v),
      | _ => None,
    }
  }

  /// Whether the attribute appeared at all.
  pub fn is_present(&self) -> bool {
    !matches!(self, Presence::Absent)
  }

  /// `other` wins wherever it is present (the merge rule of attribute
  /// inheritance: most specific level wins per attribute).
  pub fn overridden_by(self, other: Self) -> Self
    where T: Copy
  {
    match other {
      | Presence::Absent => self,
      | _ => other,
    }
  }
}

/// Notification attributes (`pmin`/`pmax`/`gt`/`lt`/`st`/`epmin`/`epmax`/
/// `edge`/`con`/`hqmax`), as carried by Observe and Write-Attributes
/// queries.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
#[allow(missing_docs)]
pub struct NotificationAttrs {
  pub pmin: Presence<u32>,
  pub pmax: Presence<u32>,
  pub gt: Presence<f64>,
  pub lt: Presence<f64>,
  pub st: Presence<f64>,
  pub epmin: Presence<u32>,
  pub epmax: Presence<u32>,
  pub edge: Presence<u32>,
  pub con: Presence<u32>,
  pub hqmax: Presence<u32>,
}

impl NotificationAttrs {
  /// Whether any attribute appeared.
  pub fn any_present(&self) -> bool {
    self.pmin.is_present()
    || self.pmax.is_present()
    || self.gt.is_present()
    || self.lt.is_present()
    || self.st.is_present()
    || self.epmin.is_present()
    || self.epmax.is_present()
    || self.edge.is_present()
    || self.con.is_present()
    || self.hqmax.is_present()
  }

  pub(crate) fn from_query(items: &[&str]) -> Result<Self, ParseError> {
    let mut attrs = Self::default();

    for item in items {
      let (name, value) = split_item(item);
      match name {
        | "pmin" => attrs.pmin = parse_presence_u32(value)?,
        | "pmax" => attrs.pmax = parse_presence_u32(value)?,
        | "gt" => attrs.gt = parse_presence_f64(value)?,
        | "lt" => attrs.lt = parse_presence_f64(value)?,
        | "st" => attrs.st = parse_presence_f64(value)?,
        | "epmin" => attrs.epmin = parse_presence_u32(value)?,
        | "epmax" => attrs.epmax = parse_presence_u32(value)?,
        | "edge" => attrs.edge = parse_presence_u32(value)?,
        | "con" => attrs.con = parse_presence_u32(value)?,
        | "hqmax" => attrs.hqmax = parse_presence_u32(value)?,
        | _ => {},
      }
    }

    Ok(attrs)
  }

  pub(crate) fn for_each_item<E>(&self,
                                 f: &mut dyn FnMut(&str) -> Result<(), E>)
                                 -> Result<(), E>
    where E: From<EncodeError>
  {
    emit_u32("pmin", &self.pmin, f)?;
    emit_u32("pmax", &self.pmax, f)?;
    emit_f64("gt", &self.gt, f)?;
    emit_f64("lt", &self.lt, f)?;
    emit_f64("st", &self.st, f)?;
    emit_u32("epmin", &self.epmin, f)?;
    emit_u32("epmax", &self.epmax, f)?;
    emit_u32("edge", &self.edge, f)?;
    emit_u32("con", &self.con, f)?;
    emit_u32("hqmax", &self.hqmax, f)
  }

  /// Whether a query-item list contains any known notification attribute
  /// (used to tell Write-Attributes apart from a payloadless Write).
  pub fn query_mentions_any(items: &[&str]) -> bool {
    items.iter().any(|item| {
                  matches!(split_item(item).0,
                           "pmin" | "pmax" | "gt" | "lt" | "st" | "epmin"
                           | "epmax" | "edge" | "con" | "hqmax")
                })
  }
}

/// The `depth` attribute of a Discover request.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct DiscoverAttrs {
  /// How many levels below the target to include
  pub depth: Presence<u32>,
}

impl DiscoverAttrs {
  pub(crate) fn from_query(items: &[&str]) -> Result<Self, ParseError> {
    let mut attrs = Self::default();

    for item in items {
      if let ("depth", value) = split_item(item) {
        attrs.depth = parse_presence_u32(value)?;
      }
    }

    Ok(attrs)
  }
}

impl<T: Eq> Eq for Presence<T> {}

/// Register / Update request attributes. Strings borrow from the buffer
/// the request was built from (or decoded out of).
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct RegisterAttrs<'a> {
  /// Endpoint client name (`ep=`)
  pub endpoint: Option<&'a str>,
  /// Registration lifetime in seconds (`lt=`)
  pub lifetime: Option<u32>,
  /// LwM2M enabler version (`lwm2m=`)
  pub lwm2m_ver: Option<&'a str>,
  /// Binding mode (`b=`)
  pub binding: Option<&'a str>,
  /// MSISDN for SMS binding (`sms=`)
  pub sms_number: Option<&'a str>,
  /// Queue-mode flag (`Q`)
  pub queue_mode: bool,
}

impl<'a> RegisterAttrs<'a> {
  pub(crate) fn from_query(items: &[&'a str]) -> Result<Self, ParseError> {
    let mut attrs = Self::default();

    for item in items.iter().copied() {
      let (name, value) = split_item(item);
      match name {
        | "ep" => attrs.endpoint = value,
        | "lt" => {
          attrs.lifetime = Some(parse_u32(value.ok_or(ParseError::Malformed)?)?)
        },
        | "lwm2m" => attrs.lwm2m_ver = value,
        | "b" => attrs.binding = value,
        | "sms" => attrs.sms_number = value,
        | "Q" => attrs.queue_mode = true,
        | _ => {},
      }
    }

    Ok(attrs)
  }

  pub(crate) fn for_each_item<E>(&self,
                                 f: &mut dyn FnMut(&str) -> Result<(), E>)
                                 -> Result<(), E>
    where E: From<EncodeError>
  {
    if let Some(ep) = self.endpoint {
      emit_pair("ep", ep, f)?;
    }
    if let Some(lt) = self.lifetime {
      let mut item = ItemBuf::default();
      write!(&mut item, "lt={}", lt).map_err(|_| EncodeError::BufTooSmall)?;
      f(item.as_str())?;
    }
    if let Some(ver) = self.lwm2m_ver {
      emit_pair("lwm2m", ver, f)?;
    }
    if let Some(b) = self.binding {
      emit_pair("b", b, f)?;
    }
    if let Some(sms) = self.sms_number {
      emit_pair("sms", sms, f)?;
    }
    if self.queue_mode {
      f("Q")?;
    }
    Ok(())
  }
}

/// Bootstrap-Request attributes.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct BootstrapAttrs<'a> {
  /// Endpoint client name (`ep=`)
  pub endpoint: Option<&'a str>,
  /// Preferred content format for the bootstrap sequence (`pct=`)
  pub preferred_content_format: Option<ContentFormat>,
}

impl<'a> BootstrapAttrs<'a> {
  pub(crate) fn from_query(items: &[&'a str]) -> Result<Self, ParseError> {
    let mut attrs = Self::default();

    for item in items.iter().copied() {
      let (name, value) = split_item(item);
      match name {
        | "ep" => attrs.endpoint = value,
        | "pct" => {
          let v = parse_u32(value.ok_or(ParseError::Malformed)?)?;
          if v > u16::MAX as u32 {
            return Err(ParseError::Malformed);
          }
          attrs.preferred_content_format = Some(ContentFormat(v as u16));
        },
        | _ => {},
      }
    }

    Ok(attrs)
  }

  pub(crate) fn for_each_item<E>(&self,
                                 f: &mut dyn FnMut(&str) -> Result<(), E>)
                                 -> Result<(), E>
    where E: From<EncodeError>
  {
    if let Some(ep) = self.endpoint {
      emit_pair("ep", ep, f)?;
    }
    if let Some(ContentFormat(pct)) = self.preferred_content_format {
      let mut item = ItemBuf::default();
      write!(&mut item, "pct={}", pct).map_err(|_| EncodeError::BufTooSmall)?;
      f(item.as_str())?;
    }
    Ok(())
  }
}

/// The created path a Create response echoes in its Location-Path.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct CreateAttrs {
  /// Object id of the created instance
  pub oid: u16,
  /// Chosen instance id
  pub iid: u16,
}

/// Operation-specific attributes carried by a message.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub enum Attrs<'a> {
  /// No attributes on this message
  #[default]
  None,
  /// Observe / Write-Attributes
  Notification(NotificationAttrs),
  /// Discover depth
  Discover(DiscoverAttrs),
  /// Register / Update
  Register(RegisterAttrs<'a>),
  /// Bootstrap-Request
  Bootstrap(BootstrapAttrs<'a>),
  /// Create response
  CreateAck(CreateAttrs),
}

impl<'a> Attrs<'a> {
  /// The notification attributes, when present.
  pub fn notification(&self) -> Option<&NotificationAttrs> {
    match self {
      | Attrs::Notification(a) => Some(a),
      | _ => None,
    }
  }
}

fn split_item(item: &str) -> (&str, Option<&str>) {
  match item.split_once('=') {
    | Some((name, "")) => (name, None),
    | Some((name, value)) => (name, Some(value)),
    | None => (item, None),
  }
}

fn parse_presence_u32(value: Option<&str>) -> Result<Presence<u32>, ParseError> {
  match value {
    | None => Ok(Presence::Unset),
    | Some(s) => parse_u32(s).map(Presence::Value),
  }
}

fn parse_presence_f64(value: Option<&str>) -> Result<Presence<f64>, ParseError> {
  match value {
    | None => Ok(Presence::Unset),
    | Some(s) => parse_f64(s).map(Presence::Value),
  }
}

pub(crate) fn parse_u32(s: &str) -> Result<u32, ParseError> {
  if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
    return Err(ParseError::Malformed);
  }

  s.parse::<u32>().map_err(|_| ParseError::Malformed)
}

pub(crate) fn parse_u16(s: &str) -> Result<u16, ParseError> {
  let v = parse_u32(s)?;
  if v > u16::MAX as u32 {
    return Err(ParseError::Malformed);
  }
  Ok(v as u16)
}

fn parse_f64(s: &str) -> Result<f64, ParseError> {
  let unsigned = s.strip_prefix('-').unwrap_or(s);
  let mut dots = 0usize;
  let shape_ok = !unsigned.is_empty()
                 && unsigned.bytes().all(|b| {
                                      if b == b'.' {
                                        dots += 1;
                                        true
                                      } else {
                                        b.is_ascii_digit()
                                      }
                                    })
                 && dots <= 1
                 && !unsigned.starts_with('.')
                 && !unsigned.ends_with('.');

  if !shape_ok {
    return Err(ParseError::Malformed);
  }

  s.parse::<f64>().map_err(|_| ParseError::Malformed)
}

fn emit_u32<E>(name: &str,
               p: &Presence<u32>,
               f: &mut dyn FnMut(&str) -> Result<(), E>)
               -> Result<(), E>
  where E: From<EncodeError>
{
  emit(name, p, f, |item, v| write!(item, "{}={}", name, v))
}

fn emit_f64<E>(name: &str,
               p: &Presence<f64>,
               f: &mut dyn FnMut(&str) -> Result<(), E>)
               -> Result<(), E>
  where E: From<EncodeError>
{
  emit(name, p, f, |item, v| write!(item, "{}={}", name, v))
}

fn emit<T: Copy, E>(name: &str,
                    p: &Presence<T>,
                    f: &mut dyn FnMut(&str) -> Result<(), E>,
                    fmt: impl Fn(&mut ItemBuf, T) -> fmt::Result)
                    -> Result<(), E>
  where E: From<EncodeError>
{
  match p {
    | Presence::Absent => Ok(()),
    | Presence::Unset => f(name),
    | Presence::Value(v) => {
      let mut item = ItemBuf::default();
      fmt(&mut item, *v).map_err(|_| EncodeError::BufTooSmall)?;
      f(item.as_str())
    },
  }
}

fn emit_pair<E>(name: &str,
                value: &str,
                f: &mut dyn FnMut(&str) -> Result<(), E>)
                -> Result<(), E>
  where E: From<EncodeError>
{
  let mut item = ItemBuf::default();
  write!(&mut item, "{}={}", name, value).map_err(|_| EncodeError::BufTooSmall)?;
  f(item.as_str())
}

/// Fixed scratch for one assembled query item.
#[derive(Debug)]
struct ItemBuf {
  buf: [u8; ATTR_ITEM_MAX],
  len: usize,
}

impl Default for ItemBuf {
  fn default() -> Self {
    Self { buf: [0; ATTR_ITEM_MAX], len: 0 }
  }
}

impl ItemBuf {
  fn as_str(&self) -> &str {
    // only ever filled through write_str with valid utf8
    core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
  }
}

impl Write for ItemBuf {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let bytes = s.as_bytes();
    if self.len + bytes.len() > ATTR_ITEM_MAX {
      return Err(fmt::Error);
    }

    self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
    self.len += bytes.len();
    Ok(())
  }
}
