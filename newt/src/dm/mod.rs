//! The data model: object descriptors, handler capability sets, and the
//! registry the dispatcher resolves paths against.
//!
//! Objects are registered as a descriptor (ids, per-resource operations
//! and types) plus a boxed [`ObjHandlers`] implementation. The registry
//! owns the descriptor arena; handlers never mutate it directly — on
//! Create/Delete the registry updates its instance tables itself after
//! the handler consents.

use newt_msg::{Code, UriPath};
use std_alloc::boxed::Box;
use std_alloc::vec::Vec;

use crate::error::Error;

/// Request → handler-call translation
pub mod dispatch;

/// Link-format payloads (Register, Discover)
pub mod linkfmt;

/// SenML JSON subset codec for multi-value payloads
pub mod senml;

/// Plain-text codec for single-value payloads
pub mod text;

/// Well-known object ids.
pub mod oid {
  /// Security object (0)
  pub const SECURITY: u16 = 0;
  /// Server object (1)
  pub const SERVER: u16 = 1;
  /// Device object (3)
  pub const DEVICE: u16 = 3;
  /// Firmware Update object (5)
  pub const FIRMWARE_UPDATE: u16 = 5;
}

/// Resource ids of the Security object (0).
pub mod security_rid {
  /// LwM2M Server URI
  pub const SERVER_URI: u16 = 0;
  /// Bootstrap-Server flag
  pub const BOOTSTRAP_SERVER: u16 = 1;
  /// Short Server ID
  pub const SSID: u16 = 10;
  /// Client Hold Off Time
  pub const CLIENT_HOLD_OFF: u16 = 11;
}

/// Resource ids of the Server object (1).
pub mod server_rid {
  /// Short Server ID
  pub const SSID: u16 = 0;
  /// Registration lifetime, seconds
  pub const LIFETIME: u16 = 1;
  /// Default minimum notification period
  pub const DEFAULT_PMIN: u16 = 2;
  /// Default maximum notification period
  pub const DEFAULT_PMAX: u16 = 3;
  /// Disable executable
  pub const DISABLE: u16 = 4;
  /// Disable timeout, seconds
  pub const DISABLE_TIMEOUT: u16 = 5;
  /// Notification storing when offline
  pub const NOTIFY_STORING: u16 = 6;
  /// Binding preference
  pub const BINDING: u16 = 7;
  /// Registration Update trigger executable
  pub const UPDATE_TRIGGER: u16 = 8;
  /// Bootstrap-Request trigger executable
  pub const BOOTSTRAP_TRIGGER: u16 = 9;
  /// Bootstrap on Registration Failure
  pub const BOOTSTRAP_ON_FAILURE: u16 = 16;
  /// Communication Retry Count
  pub const RETRY_COUNT: u16 = 17;
  /// Communication Retry Timer
  pub const RETRY_TIMER: u16 = 18;
  /// Communication Sequence Delay Timer
  pub const SEQ_DELAY_TIMER: u16 = 19;
  /// Communication Sequence Retry Count
  pub const SEQ_RETRY_COUNT: u16 = 20;
  /// Mute Send
  pub const MUTE_SEND: u16 = 23;
  /// Default notification mode (0 = NON, 1 = CON)
  pub const DEFAULT_CON: u16 = 26;
}

/// SSID addressing the Bootstrap-Server.
pub const SSID_BOOTSTRAP: u16 = 0;

/// SSID wildcard addressing every server.
pub const SSID_ANY: u16 = 0xFFFF;

/// Declared operations of a resource.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ResOp {
  /// Read-only
  R,
  /// Write-only
  W,
  /// Read / write
  RW,
  /// Executable
  E,
  /// Read-only, multi-instance
  RM,
  /// Read / write, multi-instance
  RWM,
}

impl ResOp {
  /// Whether reads are allowed
  pub fn readable(&self) -> bool {
    matches!(self, ResOp::R | ResOp::RW | ResOp::RM | ResOp::RWM)
  }

  /// Whether writes are allowed
  pub fn writable(&self) -> bool {
    matches!(self, ResOp::W | ResOp::RW | ResOp::RWM)
  }

  /// Whether execute is allowed
  pub fn executable(&self) -> bool {
    matches!(self, ResOp::E)
  }

  /// Whether the resource holds multiple instances
  pub fn multi(&self) -> bool {
    matches!(self, ResOp::RM | ResOp::RWM)
  }
}

/// Declared data type of a resource.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum DataType {
  Bytes,
  Str,
  Int,
  Uint,
  Double,
  Bool,
  Objlnk,
  Time,
  /// Executable resources carry no value
  None,
}

/// A chunk of a (possibly fragmented) bytes / string value.
///
/// `offset` locates this chunk within the full value;
/// `full_length_hint` stays 0 until the final chunk is known, then holds
/// the total length.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Chunk<'a> {
  /// This chunk's bytes
  pub data: &'a [u8],
  /// Offset of `data` within the complete value
  pub offset: usize,
  /// Total value length; 0 while unknown
  pub full_length_hint: usize,
}

impl<'a> Chunk<'a> {
  /// A chunk covering a complete value.
  pub fn whole(data: &'a [u8]) -> Self {
    Self { data, offset: 0, full_length_hint: data.len() }
  }

  /// Whether this chunk completes the value.
  pub fn is_last(&self) -> bool {
    self.full_length_hint > 0 && self.offset + self.data.len() == self.full_length_hint
  }
}

/// A complete or partial data-model value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value<'a> {
  /// Opaque bytes, possibly chunked
  Bytes(Chunk<'a>),
  /// UTF-8 text, possibly chunked (chunk boundaries may split code
  /// points; reassemble before interpreting)
  Str(Chunk<'a>),
  /// Signed integer
  Int(i64),
  /// Unsigned integer
  Uint(u64),
  /// Double-precision float
  Double(f64),
  /// Boolean
  Bool(bool),
  /// Object link
  Objlnk {
    /// Target object id
    oid: u16,
    /// Target instance id
    iid: u16,
  },
  /// Unix timestamp, seconds
  Time(i64),
  /// No value (aggregates, removals)
  Null,
}

impl<'a> Value<'a> {
  /// The declared type this value satisfies.
  pub fn data_type(&self) -> DataType {
    match self {
      | Value::Bytes(_) => DataType::Bytes,
      | Value::Str(_) => DataType::Str,
      | Value::Int(_) => DataType::Int,
      | Value::Uint(_) => DataType::Uint,
      | Value::Double(_) => DataType::Double,
      | Value::Bool(_) => DataType::Bool,
      | Value::Objlnk { .. } => DataType::Objlnk,
      | Value::Time(_) => DataType::Time,
      | Value::Null => DataType::None,
    }
  }

  /// Numeric view for threshold evaluation (gt / lt / st).
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      | Value::Int(v) => Some(*v as f64),
      | Value::Uint(v) => Some(*v as f64),
      | Value::Double(v) => Some(*v),
      | Value::Time(v) => Some(*v as f64),
      | Value::Bool(v) => Some(*v as u8 as f64),
      | _ => None,
    }
  }

  /// The u32 view, when the value is a non-negative integer that fits.
  pub fn as_u32(&self) -> Option<u32> {
    match self {
      | Value::Int(v) if *v >= 0 && *v <= u32::MAX as i64 => Some(*v as u32),
      | Value::Uint(v) if *v <= u32::MAX as u64 => Some(*v as u32),
      | _ => None,
    }
  }

  /// The u16 view, when the value is a non-negative integer that fits.
  pub fn as_u16(&self) -> Option<u16> {
    self.as_u32().filter(|v| *v <= u16::MAX as u32).map(|v| v as u16)
  }

  /// The bool view.
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      | Value::Bool(b) => Some(*b),
      | _ => None,
    }
  }
}

/// Copy one incoming chunk of an opaque value into `buffer` at its
/// offset. `out_len` is set to the total length once the last chunk has
/// arrived. Overflow yields 5.00.
pub fn write_bytes_chunked(value: &Value<'_>,
                           buffer: &mut [u8],
                           out_len: &mut usize)
                           -> Result<bool, Code> {
  let chunk = match value {
    | Value::Bytes(c) => c,
    | _ => return Err(Code::INTERNAL_SERVER_ERROR),
  };

  if chunk.offset + chunk.data.len() > buffer.len() {
    return Err(Code::INTERNAL_SERVER_ERROR);
  }

  buffer[chunk.offset..chunk.offset + chunk.data.len()].copy_from_slice(chunk.data);
  let last = chunk.is_last();
  if last {
    *out_len = chunk.full_length_hint;
  }
  Ok(last)
}

/// Copy one incoming chunk of a string value into `buffer`, NUL-padding
/// the byte after the final chunk (so `buffer` needs one spare byte).
pub fn write_string_chunked(value: &Value<'_>, buffer: &mut [u8]) -> Result<bool, Code> {
  let chunk = match value {
    | Value::Str(c) => c,
    | _ => return Err(Code::INTERNAL_SERVER_ERROR),
  };

  // + terminator
  if chunk.offset + chunk.data.len() + 1 > buffer.len() {
    return Err(Code::INTERNAL_SERVER_ERROR);
  }

  buffer[chunk.offset..chunk.offset + chunk.data.len()].copy_from_slice(chunk.data);
  let last = chunk.is_last();
  if last {
    buffer[chunk.full_length_hint] = 0;
  }
  Ok(last)
}

/// Descriptor of one resource.
#[derive(Clone, Debug)]
pub struct ResDef {
  /// Resource id
  pub rid: u16,
  /// Allowed operations
  pub op: ResOp,
  /// Value type
  pub typ: DataType,
  /// Instance ids, for multi-instance resources; sorted ascending
  pub insts: Vec<u16>,
}

impl ResDef {
  /// A single-instance resource descriptor.
  pub fn new(rid: u16, op: ResOp, typ: DataType) -> Self {
    Self { rid, op, typ, insts: Vec::new() }
  }
}

/// Descriptor of one object instance.
#[derive(Clone, Debug)]
pub struct InstDef {
  /// Instance id
  pub iid: u16,
  /// Resources, sorted ascending by rid
  pub resources: Vec<ResDef>,
}

/// Descriptor of one object.
#[derive(Clone, Debug)]
pub struct ObjDef {
  /// Object id
  pub oid: u16,
  /// Optional object version advertised during Register
  pub version: Option<&'static str>,
  /// Most instances the object may ever hold
  pub max_insts: usize,
  /// Live instances, sorted ascending by iid
  pub insts: Vec<InstDef>,
  /// Resource set stamped onto instances the server Creates
  pub res_template: Vec<ResDef>,
}

/// The capability set of an object implementation. Every method has a
/// "not supported" (or no-op, for transactions) default; the dispatcher
/// maps an absent capability to 4.05 Method Not Allowed.
///
/// Handlers are synchronous, must not block, and must not re-enter the
/// session.
pub trait ObjHandlers {
  /// Produce the value of a resource (instance).
  fn res_read(&mut self, _path: &UriPath) -> Result<Value<'_>, Code> {
    Err(Code::METHOD_NOT_ALLOWED)
  }

  /// Apply (a chunk of) a new value to a resource (instance).
  fn res_write(&mut self, _path: &UriPath, _value: &Value<'_>) -> Result<(), Code> {
    Err(Code::METHOD_NOT_ALLOWED)
  }

  /// Execute a resource with optional arguments.
  fn res_execute(&mut self, _path: &UriPath, _args: Option<&[u8]>) -> Result<(), Code> {
    Err(Code::METHOD_NOT_ALLOWED)
  }

  /// Consent to creating instance `iid` and set up its state.
  fn inst_create(&mut self, _iid: u16) -> Result<(), Code> {
    Err(Code::METHOD_NOT_ALLOWED)
  }

  /// Consent to deleting instance `iid` and drop its state.
  fn inst_delete(&mut self, _iid: u16) -> Result<(), Code> {
    Err(Code::METHOD_NOT_ALLOWED)
  }

  /// Reset instance `iid` to defaults (Write-Replace on an instance).
  fn inst_reset(&mut self, _iid: u16) -> Result<(), Code> {
    Ok(())
  }

  /// Consent to creating a resource instance.
  fn res_inst_create(&mut self, _path: &UriPath) -> Result<(), Code> {
    Err(Code::METHOD_NOT_ALLOWED)
  }

  /// Consent to deleting a resource instance.
  fn res_inst_delete(&mut self, _path: &UriPath) -> Result<(), Code> {
    Err(Code::METHOD_NOT_ALLOWED)
  }

  /// A mutating operation is about to touch this object: snapshot any
  /// state needed for rollback.
  fn transaction_begin(&mut self) -> Result<(), Code> {
    Ok(())
  }

  /// All handler calls succeeded; verify cross-resource consistency.
  fn transaction_validate(&mut self) -> Result<(), Code> {
    Ok(())
  }

  /// The operation ended. On `success == false`, restore the snapshot
  /// taken in [`ObjHandlers::transaction_begin`].
  fn transaction_end(&mut self, _success: bool) {}
}

pub(crate) struct ObjEntry {
  pub(crate) def: ObjDef,
  pub(crate) handlers: Box<dyn ObjHandlers>,
  pub(crate) in_transaction: bool,
}

impl core::fmt::Debug for ObjEntry {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ObjEntry")
     .field("def", &self.def)
     .field("in_transaction", &self.in_transaction)
     .finish()
  }
}

/// The object arena, indexed by oid.
#[derive(Debug, Default)]
pub struct Registry {
  pub(crate) objs: Vec<ObjEntry>,
}

impl Registry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of registered objects.
  pub fn object_count(&self) -> usize {
    self.objs.len()
  }

  /// Register an object. Instances and resources must be sorted
  /// ascending; a duplicate oid is rejected.
  pub fn add(&mut self, def: ObjDef, handlers: Box<dyn ObjHandlers>) -> Result<(), Error> {
    if self.index_of(def.oid).is_some() {
      return Err(Error::BAD_REQUEST);
    }

    let sorted = def.insts.windows(2).all(|w| w[0].iid < w[1].iid)
                 && def.insts.iter().all(|inst| {
                                      inst.resources
                                          .windows(2)
                                          .all(|w| w[0].rid < w[1].rid)
                                    });
    if !sorted || def.insts.len() > def.max_insts {
      return Err(Error::BAD_REQUEST);
    }

    let at = self.objs
                 .iter()
                 .position(|o| o.def.oid > def.oid)
                 .unwrap_or(self.objs.len());
    self.objs.insert(at,
                     ObjEntry { def,
                                handlers,
                                in_transaction: false });
    Ok(())
  }

  /// Remove an object by oid.
  pub fn remove(&mut self, oid: u16) -> Result<(), Error> {
    match self.index_of(oid) {
      | Some(ix) => {
        self.objs.remove(ix);
        Ok(())
      },
      | None => Err(Error::NOT_FOUND),
    }
  }

  pub(crate) fn index_of(&self, oid: u16) -> Option<usize> {
    self.objs.iter().position(|o| o.def.oid == oid)
  }

  pub(crate) fn entry(&self, oid: u16) -> Option<&ObjEntry> {
    self.index_of(oid).map(|ix| &self.objs[ix])
  }

  pub(crate) fn entry_mut(&mut self, oid: u16) -> Option<&mut ObjEntry> {
    self.index_of(oid).map(move |ix| &mut self.objs[ix])
  }

  /// Whether `path` addresses an existing entity.
  pub fn exists(&self, path: &UriPath) -> bool {
    self.resolve(path).is_ok()
  }

  /// Resolve a path against the descriptor arena.
  pub(crate) fn resolve(&self, path: &UriPath) -> Result<(), Code> {
    let entry = match path.oid() {
      | None => return Ok(()),
      | Some(oid) => self.entry(oid).ok_or(Code::NOT_FOUND)?,
    };

    let inst = match path.iid() {
      | None => return Ok(()),
      | Some(iid) => {
        entry.def
             .insts
             .iter()
             .find(|inst| inst.iid == iid)
             .ok_or(Code::NOT_FOUND)?
      },
    };

    let res = match path.rid() {
      | None => return Ok(()),
      | Some(rid) => {
        inst.resources
            .iter()
            .find(|r| r.rid == rid)
            .ok_or(Code::NOT_FOUND)?
      },
    };

    match path.riid() {
      | None => Ok(()),
      | Some(riid) if res.op.multi() && res.insts.contains(&riid) => Ok(()),
      | Some(_) => Err(Code::NOT_FOUND),
    }
  }

  pub(crate) fn res_def(&self, path: &UriPath) -> Option<&ResDef> {
    let entry = self.entry(path.oid()?)?;
    let inst = entry.def.insts.iter().find(|i| Some(i.iid) == path.iid())?;
    inst.resources.iter().find(|r| Some(r.rid) == path.rid())
  }

  /// Read one resource (instance) value through its handler, with the
  /// declared-operation check applied.
  pub fn res_read(&mut self, path: &UriPath) -> Result<Value<'_>, Code> {
    self.resolve(path)?;
    let res = self.res_def(path).ok_or(Code::NOT_FOUND)?;
    if !res.op.readable() {
      return Err(Code::METHOD_NOT_ALLOWED);
    }
    if res.op.multi() && path.riid().is_none() {
      return Err(Code::BAD_REQUEST);
    }

    let oid = path.oid().ok_or(Code::NOT_FOUND)?;
    let entry = self.entry_mut(oid).ok_or(Code::NOT_FOUND)?;
    entry.handlers.res_read(path)
  }

  /// Create an instance: the handler consents, then the registry stamps
  /// the descriptor. Returns the chosen iid.
  pub(crate) fn create_instance(&mut self, oid: u16, want_iid: Option<u16>) -> Result<u16, Code> {
    let entry = self.entry_mut(oid).ok_or(Code::NOT_FOUND)?;

    if entry.def.insts.len() >= entry.def.max_insts {
      return Err(Code::INTERNAL_SERVER_ERROR);
    }

    let iid = match want_iid {
      | Some(iid) => {
        if entry.def.insts.iter().any(|i| i.iid == iid) {
          return Err(Code::BAD_REQUEST);
        }
        iid
      },
      | None => {
        let mut candidate = 0u16;
        while entry.def.insts.iter().any(|i| i.iid == candidate) {
          candidate += 1;
        }
        candidate
      },
    };

    entry.handlers.inst_create(iid)?;

    let at = entry.def
                  .insts
                  .iter()
                  .position(|i| i.iid > iid)
                  .unwrap_or(entry.def.insts.len());
    let resources = entry.def.res_template.clone();
    entry.def.insts.insert(at, InstDef { iid, resources });
    Ok(iid)
  }

  /// Make sure a multi-resource instance exists, asking the handler to
  /// create it when missing.
  pub(crate) fn ensure_res_instance(&mut self, path: &UriPath) -> Result<(), Code> {
    let (oid, riid) = match (path.oid(), path.riid()) {
      | (Some(oid), Some(riid)) => (oid, riid),
      | _ => return Err(Code::BAD_REQUEST),
    };

    {
      let res = self.res_def(path).ok_or(Code::NOT_FOUND)?;
      if !res.op.multi() {
        return Err(Code::METHOD_NOT_ALLOWED);
      }
      if res.insts.contains(&riid) {
        return Ok(());
      }
    }

    let entry = self.entry_mut(oid).ok_or(Code::NOT_FOUND)?;
    entry.handlers.res_inst_create(path)?;

    let inst = entry.def
                    .insts
                    .iter_mut()
                    .find(|i| Some(i.iid) == path.iid())
                    .ok_or(Code::NOT_FOUND)?;
    let res = inst.resources
                  .iter_mut()
                  .find(|r| Some(r.rid) == path.rid())
                  .ok_or(Code::NOT_FOUND)?;
    let at = res.insts.iter().position(|r| *r > riid).unwrap_or(res.insts.len());
    res.insts.insert(at, riid);
    Ok(())
  }

  /// Delete a resource instance through its handler and drop it from the
  /// descriptor.
  pub(crate) fn delete_res_instance(&mut self, path: &UriPath) -> Result<(), Code> {
    self.resolve(path)?;
    let oid = path.oid().ok_or(Code::NOT_FOUND)?;
    let riid = path.riid().ok_or(Code::BAD_REQUEST)?;

    let entry = self.entry_mut(oid).ok_or(Code::NOT_FOUND)?;
    entry.handlers.res_inst_delete(path)?;

    let inst = entry.def
                    .insts
                    .iter_mut()
                    .find(|i| Some(i.iid) == path.iid())
                    .ok_or(Code::NOT_FOUND)?;
    let res = inst.resources
                  .iter_mut()
                  .find(|r| Some(r.rid) == path.rid())
                  .ok_or(Code::NOT_FOUND)?;
    res.insts.retain(|r| *r != riid);
    Ok(())
  }

  /// Delete an instance through its handler and drop the descriptor.
  pub(crate) fn delete_instance(&mut self, oid: u16, iid: u16) -> Result<(), Code> {
    let entry = self.entry_mut(oid).ok_or(Code::NOT_FOUND)?;
    let at = entry.def
                  .insts
                  .iter()
                  .position(|i| i.iid == iid)
                  .ok_or(Code::NOT_FOUND)?;

    entry.handlers.inst_delete(iid)?;
    entry.def.insts.remove(at);
    Ok(())
  }

  /// Drop every Security / Server instance not tied to the
  /// Bootstrap-Server. Called after a failed bootstrap.
  pub fn bootstrap_cleanup(&mut self) {
    let bootstrap_security: Vec<u16> = self.security_instances()
                                          .into_iter()
                                          .filter(|(_, is_bs)| *is_bs)
                                          .map(|(iid, _)| iid)
                                          .collect();

    if let Some(entry) = self.entry(oid::SECURITY) {
      let doomed: Vec<u16> = entry.def
                                  .insts
                                  .iter()
                                  .map(|i| i.iid)
                                  .filter(|iid| !bootstrap_security.contains(iid))
                                  .collect();
      for iid in doomed {
        let _ = self.delete_instance(oid::SECURITY, iid);
      }
    }

    if let Some(entry) = self.entry(oid::SERVER) {
      let doomed: Vec<u16> = entry.def.insts.iter().map(|i| i.iid).collect();
      for iid in doomed {
        let _ = self.delete_instance(oid::SERVER, iid);
      }
    }
  }

  /// `(iid, is_bootstrap)` of every Security instance.
  pub(crate) fn security_instances(&mut self) -> Vec<(u16, bool)> {
    let iids: Vec<u16> = self.entry(oid::SECURITY)
                             .map(|e| e.def.insts.iter().map(|i| i.iid).collect())
                             .unwrap_or_default();

    iids.into_iter()
        .map(|iid| {
          let path = UriPath::resource(oid::SECURITY, iid, security_rid::BOOTSTRAP_SERVER);
          let is_bs = self.res_read(&path)
                          .ok()
                          .and_then(|v| v.as_bool())
                          .unwrap_or(false);
          (iid, is_bs)
        })
        .collect()
  }

  /// Whether at least one non-bootstrap Security + Server pair exists
  /// (the Bootstrap-Finish validation).
  pub fn has_regular_server(&mut self) -> bool {
    let regular: Vec<u16> = self.security_instances()
                                .into_iter()
                                .filter(|(_, is_bs)| !*is_bs)
                                .map(|(iid, _)| iid)
                                .collect();

    for sec_iid in regular {
      let ssid = self.res_read(&UriPath::resource(oid::SECURITY, sec_iid, security_rid::SSID))
                     .ok()
                     .and_then(|v| v.as_u16());
      let Some(ssid) = ssid else { continue };

      let server_iids: Vec<u16> = self.entry(oid::SERVER)
                                      .map(|e| e.def.insts.iter().map(|i| i.iid).collect())
                                      .unwrap_or_default();
      for iid in server_iids {
        let server_ssid =
          self.res_read(&UriPath::resource(oid::SERVER, iid, server_rid::SSID))
              .ok()
              .and_then(|v| v.as_u16());
        if server_ssid == Some(ssid) {
          return true;
        }
      }
    }
    false
  }
}
