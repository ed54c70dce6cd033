//! Turns one decoded server request into handler calls: path resolution,
//! capability checks, transactional write semantics with rollback, read
//! streaming and Block1 write chunking.

use newt_msg::{Code, ContentFormat, Message, NotificationAttrs, Operation, UriPath};
use std_alloc::vec::Vec;

use super::{linkfmt, oid, senml, text, DataType, Registry, Value};
use crate::exchange::ReadOut;

/// How incoming payload bytes reach the data model.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum WriteMode {
  /// No body expected
  None,
  /// Bytes / strings streamed chunk-by-chunk to `res_write`
  Stream,
  /// Body buffered whole, parsed on the last chunk
  Buffered,
}

/// State of one in-flight server request against the data model. Lives
/// from the decoded request until the exchange's completion.
#[derive(Debug)]
pub struct DmOp {
  op: Operation,
  path: UriPath,
  bootstrap: bool,
  success_code: Code,

  // outgoing document, drained block-wise
  doc: Vec<u8>,
  pos: usize,
  doc_format: Option<ContentFormat>,

  write_mode: WriteMode,
  write_typ: DataType,
  write_offset: usize,
  buffered: Vec<u8>,
  content_format: Option<ContentFormat>,

  txn_oids: Vec<u16>,
  txn_open: bool,
  created: Option<(u16, u16)>,
  executed: Option<UriPath>,
  composite: Vec<UriPath>,
}

impl DmOp {
  /// The success response code for this operation.
  pub fn success_code(&self) -> Code {
    self.success_code
  }

  /// The operation being carried.
  pub fn operation(&self) -> Operation {
    self.op
  }

  /// The request's target path.
  pub fn path(&self) -> &UriPath {
    &self.path
  }

  /// The created `(oid, iid)`, after a successful Create.
  pub fn created(&self) -> Option<(u16, u16)> {
    self.created
  }

  /// The path of an Execute that ran, for session-level triggers
  /// (Disable, Update trigger, Bootstrap-Request trigger).
  pub fn executed(&self) -> Option<&UriPath> {
    self.executed.as_ref()
  }

  /// The selector paths of a composite operation, once its request
  /// payload has been fully received.
  pub fn composite_paths(&self) -> &[UriPath] {
    &self.composite
  }

  /// Validate and stage `msg` against the registry. `Err(code)` means
  /// "answer with this error, touch nothing".
  ///
  /// `attrs` feeds Discover attribute listings; `bootstrap` relaxes
  /// access rules for the Bootstrap-Server's own requests.
  pub fn begin(reg: &mut Registry,
               msg: &Message<'_>,
               bootstrap: bool,
               attrs: &dyn Fn(&UriPath) -> Option<NotificationAttrs>)
               -> Result<DmOp, Code> {
    let path = msg.uri;

    if !bootstrap && path.oid() == Some(oid::SECURITY) {
      // the Security object is never visible to regular servers
      return Err(Code::UNAUTHORIZED);
    }

    let mut op = DmOp { op: msg.operation,
                        path,
                        bootstrap,
                        success_code: Code::CHANGED,
                        doc: Vec::new(),
                        pos: 0,
                        doc_format: None,
                        write_mode: WriteMode::None,
                        write_typ: DataType::None,
                        write_offset: 0,
                        buffered: Vec::new(),
                        content_format: msg.content_format,
                        txn_oids: Vec::new(),
                        txn_open: false,
                        created: None,
                        executed: None,
                        composite: Vec::new() };

    match msg.operation {
      | Operation::DmRead | Operation::InfObserve | Operation::InfCancelObserve => {
        // a cancel-observe answers like a read, with the current value
        op.success_code = Code::CONTENT;
        op.build_read_doc(reg, msg.accept)?;
      },
      | Operation::DmDiscover => {
        reg.resolve(&path)?;
        if path.is_root() {
          return Err(Code::METHOD_NOT_ALLOWED);
        }
        op.success_code = Code::CONTENT;
        let depth = match msg.attrs {
          | newt_msg::Attrs::Discover(d) => d.depth.value().copied(),
          | _ => None,
        };
        op.doc = linkfmt::discover_payload(reg, &path, depth, attrs);
        op.doc_format = Some(ContentFormat::LINK_FORMAT);
      },
      | Operation::DmExecute => {
        reg.resolve(&path)?;
        let res = reg.res_def(&path).ok_or(Code::METHOD_NOT_ALLOWED)?;
        if !res.op.executable() {
          return Err(Code::METHOD_NOT_ALLOWED);
        }
        let args = (!msg.payload.is_empty()).then_some(msg.payload);
        let entry = reg.entry_mut(path.oid().unwrap_or(0)).ok_or(Code::NOT_FOUND)?;
        entry.handlers.res_execute(&path, args)?;
        op.executed = Some(path);
      },
      | Operation::DmWriteReplace | Operation::DmWritePartial => {
        op.begin_write(reg, msg)?;
      },
      | Operation::DmCreate => {
        if path.len() != 1 {
          return Err(Code::BAD_REQUEST);
        }
        reg.resolve(&path)?;
        op.success_code = Code::CREATED;
        op.open_transaction(reg, path.oid())?;
        if msg.payload.is_empty() && msg.block.is_none() {
          let iid = reg.create_instance(path.oid().unwrap_or(0), None)
                       .map_err(|code| op.abort(reg, code))?;
          op.created = Some((path.oid().unwrap_or(0), iid));
        } else {
          op.write_mode = WriteMode::Buffered;
        }
      },
      | Operation::DmDelete => {
        op.success_code = Code::DELETED;
        op.begin_delete(reg)?;
      },
      | Operation::DmReadComp | Operation::InfObserveComp => {
        #[cfg(feature = "composite")]
        {
          op.success_code = Code::CONTENT;
          op.write_mode = WriteMode::Buffered;
        }
        #[cfg(not(feature = "composite"))]
        return Err(Code::NOT_IMPLEMENTED);
      },
      | Operation::DmWriteComp => {
        #[cfg(feature = "composite")]
        {
          op.write_mode = WriteMode::Buffered;
        }
        #[cfg(not(feature = "composite"))]
        return Err(Code::NOT_IMPLEMENTED);
      },
      | _ => return Err(Code::METHOD_NOT_ALLOWED),
    }

    Ok(op)
  }

  fn abort(&mut self, reg: &mut Registry, code: Code) -> Code {
    self.close_transactions(reg, false);
    code
  }

  fn open_transaction(&mut self, reg: &mut Registry, target: Option<u16>) -> Result<(), Code> {
    let oids: Vec<u16> = match target {
      | Some(oid) => [oid].into_iter().collect(),
      | None => reg.objs.iter().map(|o| o.def.oid).collect(),
    };

    for oid in oids {
      if let Some(entry) = reg.entry_mut(oid) {
        if !entry.in_transaction {
          if let Err(code) = entry.handlers.transaction_begin() {
            self.close_transactions_inner(reg, false);
            return Err(code);
          }
          entry.in_transaction = true;
          self.txn_oids.push(oid);
          self.txn_open = true;
        }
      }
    }
    Ok(())
  }

  fn validate_transactions(&mut self, reg: &mut Registry) -> Result<(), Code> {
    for oid in self.txn_oids.iter() {
      if let Some(entry) = reg.entry_mut(*oid) {
        if let Err(code) = entry.handlers.transaction_validate() {
          self.close_transactions_inner(reg, false);
          return Err(code);
        }
      }
    }
    self.close_transactions_inner(reg, true);
    Ok(())
  }

  fn close_transactions_inner(&mut self, reg: &mut Registry, success: bool) {
    for oid in self.txn_oids.drain(..) {
      if let Some(entry) = reg.entry_mut(oid) {
        if entry.in_transaction {
          entry.handlers.transaction_end(success);
          entry.in_transaction = false;
        }
      }
    }
    self.txn_open = false;
  }

  fn close_transactions(&mut self, reg: &mut Registry, success: bool) {
    self.close_transactions_inner(reg, success);
  }

  /// The exchange ended (completion fired). Rolls back transactions the
  /// operation never got to close (cancellation, timeout mid-transfer).
  pub fn finish(&mut self, reg: &mut Registry, success: bool) {
    if self.txn_open {
      self.close_transactions(reg, success);
    }
  }

  fn build_read_doc(&mut self,
                    reg: &mut Registry,
                    accept: Option<ContentFormat>)
                    -> Result<(), Code> {
    reg.resolve(&self.path)?;

    let targets = read_targets(reg, &self.path, self.bootstrap)?;
    let single = self.path.len() >= 3 && targets.len() == 1;
    if single && accept == Some(ContentFormat::PLAIN_TEXT) {
      let value = reg.res_read(&targets[0])?;
      self.doc = text::encode(&value);
      self.doc_format = Some(ContentFormat::PLAIN_TEXT);
      return Ok(());
    }
    if single && accept == Some(ContentFormat::OPAQUE) {
      match reg.res_read(&targets[0])? {
        | Value::Bytes(c) => {
          self.doc = c.data.to_vec();
          self.doc_format = Some(ContentFormat::OPAQUE);
          return Ok(());
        },
        | _ => return Err(Code::NOT_ACCEPTABLE),
      }
    }

    let mut doc = std_alloc::string::String::new();
    for target in targets.iter() {
      let value = reg.res_read(target)?;
      senml::encode_entry(&mut doc, target, &value);
    }
    if doc.is_empty() {
      doc.push_str("[]");
    }
    self.doc = doc.into_bytes();
    self.doc_format = Some(ContentFormat::SENML_JSON);
    Ok(())
  }

  fn begin_write(&mut self, reg: &mut Registry, msg: &Message<'_>) -> Result<(), Code> {
    let path = self.path;

    if path.len() < 2 {
      return Err(Code::METHOD_NOT_ALLOWED);
    }

    // the Bootstrap-Server may write into instances that do not exist
    // yet; they are created on the fly
    if self.bootstrap && path.iid().is_some() && !reg.exists(&path.parent_instance()) {
      self.open_transaction(reg, path.oid())?;
      reg.create_instance(path.oid().unwrap_or(0), path.iid())
         .map_err(|code| self.abort(reg, code))?;
    } else {
      reg.resolve(&path)?;
      self.open_transaction(reg, path.oid())?;
    }

    if path.len() >= 3 {
      let res = reg.res_def(&path).ok_or(Code::NOT_FOUND)?;
      if !self.bootstrap && !res.op.writable() {
        return Err(self.abort(reg, Code::METHOD_NOT_ALLOWED));
      }
      if res.op.multi() && path.len() == 3
         && self.content_format != Some(ContentFormat::SENML_JSON)
      {
        // writing a whole multi-resource needs a structured format
        return Err(self.abort(reg, Code::BAD_REQUEST));
      }

      self.write_typ = res.typ;
      self.write_mode = match self.content_format {
        | Some(ContentFormat::SENML_JSON) => WriteMode::Buffered,
        | _ => match res.typ {
          | DataType::Bytes | DataType::Str => WriteMode::Stream,
          | _ => WriteMode::Buffered,
        },
      };

      if path.len() == 4 {
        reg.ensure_res_instance(&path).map_err(|code| self.abort(reg, code))?;
      }
    } else {
      // instance-level writes need a structured payload
      if self.content_format != Some(ContentFormat::SENML_JSON) {
        return Err(self.abort(reg, Code::UNSUPPORTED_CONTENT_FORMAT));
      }
      self.write_mode = WriteMode::Buffered;

      if self.op == Operation::DmWriteReplace {
        let (o, i) = (path.oid().unwrap_or(0), path.iid().unwrap_or(0));
        let entry = reg.entry_mut(o).ok_or(Code::NOT_FOUND)?;
        entry.handlers
             .inst_reset(i)
             .map_err(|code| self.abort(reg, code))?;
      }
    }

    Ok(())
  }

  fn begin_delete(&mut self, reg: &mut Registry) -> Result<(), Code> {
    let path = self.path;

    if self.bootstrap && path.len() <= 1 {
      self.open_transaction(reg, None)?;
      self.bootstrap_bulk_delete(reg)?;
      return Ok(());
    }

    match path.len() {
      | 2 => {
        reg.resolve(&path)?;
        self.open_transaction(reg, path.oid())?;
        reg.delete_instance(path.oid().unwrap_or(0), path.iid().unwrap_or(0))
           .map_err(|code| self.abort(reg, code))?;
        Ok(())
      },
      | 4 => {
        reg.resolve(&path)?;
        self.open_transaction(reg, path.oid())?;
        reg.delete_res_instance(&path)
           .map_err(|code| self.abort(reg, code))?;
        Ok(())
      },
      | _ => Err(Code::METHOD_NOT_ALLOWED),
    }
  }

  /// Bootstrap bulk delete: everything under the target except the
  /// Bootstrap-Server's own Security instance.
  fn bootstrap_bulk_delete(&mut self, reg: &mut Registry) -> Result<(), Code> {
    let target_oid = self.path.oid();
    let protected: Vec<u16> = reg.security_instances()
                                 .into_iter()
                                 .filter(|(_, is_bs)| *is_bs)
                                 .map(|(iid, _)| iid)
                                 .collect();

    let objects: Vec<u16> = reg.objs
                               .iter()
                               .map(|o| o.def.oid)
                               .filter(|o| target_oid.map(|t| t == *o).unwrap_or(true))
                               .collect();

    for obj in objects {
      let iids: Vec<u16> = reg.entry(obj)
                              .map(|e| e.def.insts.iter().map(|i| i.iid).collect())
                              .unwrap_or_default();
      for iid in iids {
        if obj == oid::SECURITY && protected.contains(&iid) {
          continue;
        }
        reg.delete_instance(obj, iid)
           .map_err(|code| self.abort(reg, code))?;
      }
    }
    Ok(())
  }

  /// Fill the next outgoing block from the staged document.
  pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<ReadOut, Code> {
    let remaining = self.doc.len() - self.pos;
    let n = remaining.min(buf.len());
    buf[..n].copy_from_slice(&self.doc[self.pos..self.pos + n]);
    self.pos += n;

    if self.pos < self.doc.len() {
      Ok(ReadOut::Again { len: n, format: self.doc_format })
    } else {
      Ok(ReadOut::Done { len: n,
                         format: if n > 0 { self.doc_format } else { None },
                         created: self.created })
    }
  }

  /// Consume the next incoming block.
  pub fn write_payload(&mut self,
                       reg: &mut Registry,
                       chunk: &[u8],
                       last_block: bool)
                       -> Result<(), Code> {
    match self.write_mode {
      | WriteMode::None => Ok(()),
      | WriteMode::Stream => {
        let value_chunk = super::Chunk { data: chunk,
                                         offset: self.write_offset,
                                         full_length_hint: if last_block {
                                           self.write_offset + chunk.len()
                                         } else {
                                           0
                                         } };
        let value = match self.write_typ {
          | DataType::Str => Value::Str(value_chunk),
          | _ => Value::Bytes(value_chunk),
        };
        self.write_offset += chunk.len();

        let path = self.path;
        let entry = reg.entry_mut(path.oid().unwrap_or(0)).ok_or(Code::NOT_FOUND)?;
        if let Err(code) = entry.handlers.res_write(&path, &value) {
          return Err(self.abort(reg, code));
        }

        if last_block {
          self.validate_transactions(reg)?;
        }
        Ok(())
      },
      | WriteMode::Buffered => {
        self.buffered.extend_from_slice(chunk);
        if !last_block {
          return Ok(());
        }
        self.apply_buffered(reg)
      },
    }
  }

  fn apply_buffered(&mut self, reg: &mut Registry) -> Result<(), Code> {
    let payload = core::mem::take(&mut self.buffered);

    match self.op {
      | Operation::DmWriteReplace | Operation::DmWritePartial
        if self.path.len() >= 3 && self.content_format != Some(ContentFormat::SENML_JSON) =>
      {
        // plain-text scalar
        let owned =
          text::decode(&payload, self.write_typ).map_err(|code| self.abort(reg, code))?;
        self.apply_one(reg, self.path, &owned.borrow())?;
        self.validate_transactions(reg)
      },
      | Operation::DmWriteReplace | Operation::DmWritePartial => {
        let records = senml::decode(&payload).map_err(|code| self.abort(reg, code))?;
        for (path, value) in records.iter() {
          if !self.path.is_ancestor_of(path) {
            return Err(self.abort(reg, Code::BAD_REQUEST));
          }
          self.apply_record(reg, *path, value)?;
        }
        self.validate_transactions(reg)
      },
      | Operation::DmCreate => {
        let records = senml::decode(&payload).map_err(|code| self.abort(reg, code))?;
        let obj = self.path.oid().unwrap_or(0);

        let want_iid = records.first().and_then(|(p, _)| p.iid());
        let iid = reg.create_instance(obj, want_iid)
                     .map_err(|code| self.abort(reg, code))?;
        self.created = Some((obj, iid));

        for (path, value) in records.iter() {
          if path.oid() != Some(obj) || path.iid() != Some(iid) {
            return Err(self.abort(reg, Code::BAD_REQUEST));
          }
          self.apply_record(reg, *path, value)?;
        }
        self.validate_transactions(reg)
      },
      #[cfg(feature = "composite")]
      | Operation::DmReadComp | Operation::InfObserveComp => {
        let records = senml::decode(&payload)?;
        let mut doc = std_alloc::string::String::new();

        for (path, _) in records.iter() {
          self.composite.push(*path);
          for target in read_targets(reg, path, self.bootstrap)? {
            let value = reg.res_read(&target)?;
            senml::encode_entry(&mut doc, &target, &value);
          }
        }
        if doc.is_empty() {
          doc.push_str("[]");
        }
        self.doc = doc.into_bytes();
        self.doc_format = Some(ContentFormat::SENML_JSON);
        Ok(())
      },
      #[cfg(feature = "composite")]
      | Operation::DmWriteComp => {
        let records = senml::decode(&payload).map_err(|code| self.abort(reg, code))?;
        for (path, _) in records.iter() {
          self.open_transaction(reg, path.oid())
              .map_err(|code| self.abort(reg, code))?;
        }
        for (path, value) in records.iter() {
          self.apply_record(reg, *path, value)?;
        }
        self.validate_transactions(reg)
      },
      | _ => Ok(()),
    }
  }

  fn apply_record(&mut self,
                  reg: &mut Registry,
                  path: UriPath,
                  value: &senml::SenmlValue)
                  -> Result<(), Code> {
    if path.len() < 3 {
      return Err(self.abort(reg, Code::BAD_REQUEST));
    }

    if path.len() == 4 && !reg.exists(&path) {
      reg.ensure_res_instance(&path).map_err(|code| self.abort(reg, code))?;
    } else if !reg.exists(&path) {
      return Err(self.abort(reg, Code::NOT_FOUND));
    }

    let res = match reg.res_def(&path) {
      | Some(r) => r,
      | None => return Err(self.abort(reg, Code::NOT_FOUND)),
    };
    if !self.bootstrap && !res.op.writable() {
      return Err(self.abort(reg, Code::METHOD_NOT_ALLOWED));
    }
    if res.op.multi() && path.len() == 3 {
      return Err(self.abort(reg, Code::BAD_REQUEST));
    }

    let typ = res.typ;
    let converted = convert(value, typ).map_err(|code| self.abort(reg, code))?;
    self.apply_one(reg, path, &converted.borrow())
  }

  fn apply_one(&mut self,
               reg: &mut Registry,
               path: UriPath,
               value: &Value<'_>)
               -> Result<(), Code> {
    let entry = reg.entry_mut(path.oid().unwrap_or(0)).ok_or(Code::NOT_FOUND)?;
    if let Err(code) = entry.handlers.res_write(&path, value) {
      return Err(self.abort(reg, code));
    }
    Ok(())
  }
}

/// Owned value carrier for converted SenML records.
#[derive(Clone, Debug, PartialEq)]
enum Converted {
  Int(i64),
  Uint(u64),
  Double(f64),
  Bool(bool),
  Time(i64),
  Objlnk(u16, u16),
  Str(std_alloc::string::String),
  Bytes(Vec<u8>),
}

impl Converted {
  fn borrow(&self) -> Value<'_> {
    match self {
      | Converted::Int(v) => Value::Int(*v),
      | Converted::Uint(v) => Value::Uint(*v),
      | Converted::Double(v) => Value::Double(*v),
      | Converted::Bool(b) => Value::Bool(*b),
      | Converted::Time(v) => Value::Time(*v),
      | Converted::Objlnk(o, i) => Value::Objlnk { oid: *o, iid: *i },
      | Converted::Str(s) => Value::Str(super::Chunk::whole(s.as_bytes())),
      | Converted::Bytes(b) => Value::Bytes(super::Chunk::whole(b)),
    }
  }
}

fn convert(value: &senml::SenmlValue, typ: DataType) -> Result<Converted, Code> {
  use senml::SenmlValue as S;

  Ok(match (value, typ) {
    | (S::Num(v), DataType::Int) if v.fract() == 0.0 => Converted::Int(*v as i64),
    | (S::Num(v), DataType::Time) if v.fract() == 0.0 => Converted::Time(*v as i64),
    | (S::Num(v), DataType::Uint) if v.fract() == 0.0 && *v >= 0.0 => {
      Converted::Uint(*v as u64)
    },
    | (S::Num(v), DataType::Double) => Converted::Double(*v),
    | (S::Bool(b), DataType::Bool) => Converted::Bool(*b),
    | (S::Str(s), DataType::Str) => Converted::Str(s.clone()),
    | (S::Opaque(b), DataType::Bytes) => Converted::Bytes(b.clone()),
    | (S::Objlnk(o, i), DataType::Objlnk) => Converted::Objlnk(*o, *i),
    | _ => return Err(Code::BAD_REQUEST),
  })
}

/// The readable resource-instance paths under `target`, in path order.
fn read_targets(reg: &Registry, target: &UriPath, bootstrap: bool) -> Result<Vec<UriPath>, Code> {
  if target.len() >= 3 {
    let res = reg.res_def(target).ok_or(Code::NOT_FOUND)?;
    if !res.op.readable() {
      return Err(Code::METHOD_NOT_ALLOWED);
    }
    if target.len() == 4 {
      return Ok([*target].into_iter().collect());
    }
    if res.op.multi() {
      return Ok(res.insts
                   .iter()
                   .filter_map(|riid| target.join(*riid).ok())
                   .collect());
    }
    return Ok([*target].into_iter().collect());
  }

  Ok(linkfmt::enumerate(reg, target).into_iter()
                                    .filter(|p| p.len() >= 3)
                                    .filter(|p| !(!bootstrap && p.oid() == Some(oid::SECURITY)))
                                    .filter_map(|p| {
                                      let res = reg.res_def(&p)?;
                                      if !res.op.readable() {
                                        return None;
                                      }
                                      if res.op.multi() && p.len() == 3 {
                                        // instances are listed separately
                                        return None;
                                      }
                                      Some(p)
                                    })
                                    .collect())
}

trait ParentInstance {
  fn parent_instance(&self) -> UriPath;
}

impl ParentInstance for UriPath {
  /// The instance prefix of a resource(-instance) path, or the path
  /// itself at instance level or above.
  fn parent_instance(&self) -> UriPath {
    match (self.oid(), self.iid()) {
      | (Some(o), Some(i)) => UriPath::instance(o, i),
      | _ => *self,
    }
  }
}
