//! The top-level client: one LwM2M session against one server, driven
//! by repeated non-blocking [`Session::step`] calls from the
//! application's main loop.
//!
//! Everything stateful lives in the [`Session`] aggregate: the object
//! registry, the observation engine, exactly one exchange, the message
//! buffers, and the conn-status state machine sequencing
//! bootstrap → register → (update | idle | notify | send | server
//! requests) → de-register.

use core::fmt;
use core::mem;

use newt_msg::{decode_udp, encode_udp, Attrs, Binding, BootstrapAttrs, Code, CodeKind,
               ContentFormat, CreateAttrs, LocationPath, Message, NotificationAttrs, Operation,
               RegisterAttrs, Token, UriPath};
use std_alloc::boxed::Box;
use std_alloc::collections::VecDeque;
use std_alloc::string::String;
use std_alloc::vec::Vec;

use crate::config::Config;
use crate::dm::dispatch::DmOp;
use crate::dm::{linkfmt, senml, ObjDef, ObjHandlers, Registry};
use crate::error::Error;
use crate::exchange::{Event, Exchange, Handlers, MsgMeta, ReadOut, State};
use crate::net::{Transport, TransportState};
use crate::observe::{ChangeKind, Observe};
use crate::time::{since_epoch, Clock};

mod mirror;

pub use mirror::{RetryRes, SecurityMirror, ServerMirror};

/// LwM2M protocol version advertised during Register.
pub const LWM2M_VERSION: &str = "1.1";

/// Most queued Send requests.
pub const SEND_QUEUE_MAX: usize = 4;

/// The session's connection status, reported through the status
/// callback on every transition.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnStatus {
  /// Fresh session; targets not yet chosen
  Initial,
  /// Configuration invalid; transient on the way to `Failure`
  Invalid,
  /// Retries exhausted; sticky until [`Session::restart`]
  Failure,
  /// Bootstrap sequence running
  Bootstrapping,
  /// Bootstrap finished; about to register
  Bootstrapped,
  /// Register (or a registration retry) in progress
  Registering,
  /// Registered and serving
  Registered,
  /// Disabled by the server or the application
  Suspended,
  /// Draining the transport before queue mode
  EnteringQueueMode,
  /// Transport closed; sleeping until the next scheduled action
  QueueMode,
}

/// Per-operation extra state while that phase is active.
#[derive(Copy, Clone, Debug)]
enum Details {
  None,
  Bootstrap {
    attempt: u16,
    retry_at: u64,
    deadline: u64,
    requested: bool,
  },
  Registration {
    attempt: u16,
    seq: u16,
    retry_at: u64,
  },
  Registered {
    next_update_at: u64,
  },
}

/// A staged outgoing document, drained block-wise by `read_payload`.
#[derive(Debug, Default)]
struct DocStream {
  doc: Vec<u8>,
  pos: usize,
  format: Option<ContentFormat>,
}

impl DocStream {
  fn new(doc: Vec<u8>, format: Option<ContentFormat>) -> Self {
    Self { doc, pos: 0, format }
  }

  fn empty() -> Self {
    Self::default()
  }

  fn read(&mut self, buf: &mut [u8]) -> ReadOut {
    let remaining = self.doc.len() - self.pos;
    let n = remaining.min(buf.len());
    buf[..n].copy_from_slice(&self.doc[self.pos..self.pos + n]);
    self.pos += n;

    if self.pos < self.doc.len() {
      ReadOut::Again { len: n, format: self.format }
    } else {
      ReadOut::Done { len: n,
                      format: if n > 0 { self.format } else { None },
                      created: None }
    }
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum DocKind {
  Register,
  Update,
  Deregister,
  BootstrapReq,
  Notify { slot: usize },
  Send,
  BootstrapFinishAck { ok: bool },
}

/// What the in-flight exchange is carrying.
enum Active {
  None,
  Dm(DmOp),
  Doc { kind: DocKind, stream: DocStream },
}

/// Completion data captured by the exchange glue.
#[derive(Default)]
struct Outcome {
  result: Option<Result<(), Error>>,
  response_code: Option<Code>,
  location: Vec<String>,
}

/// The [`Handlers`] adapter wiring the exchange's callbacks to whatever
/// the session has in flight.
struct Glue<'a> {
  active: &'a mut Active,
  registry: &'a mut Registry,
  outcome: &'a mut Outcome,
}

impl Handlers for Glue<'_> {
  fn read_payload(&mut self, buf: &mut [u8]) -> Result<ReadOut, Code> {
    match self.active {
      | Active::Dm(op) => op.read_payload(buf),
      | Active::Doc { stream, .. } => Ok(stream.read(buf)),
      | Active::None => Ok(ReadOut::Done { len: 0, format: None, created: None }),
    }
  }

  fn write_payload(&mut self, chunk: &[u8], last_block: bool) -> Result<(), Code> {
    match self.active {
      | Active::Dm(op) => op.write_payload(self.registry, chunk, last_block),
      | _ => Ok(()),
    }
  }

  fn completion(&mut self, response: Option<&Message<'_>>, result: Result<(), Error>) {
    if let Some(msg) = response {
      self.outcome.response_code = Some(msg.code);
      self.outcome.location = msg.location_path
                                 .segments
                                 .iter()
                                 .map(|s| String::from(*s))
                                 .collect();
    }
    if let Active::Dm(op) = self.active {
      op.finish(self.registry, result.is_ok());
    }
    self.outcome.result = Some(result);
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ShutdownPhase {
  None,
  Deregister,
  NetShutdown,
  Close,
  Done,
}

struct QueuedSend {
  doc: Vec<u8>,
  confirmable: bool,
}

/// One LwM2M client session. See [`Session::step`].
pub struct Session<C: Clock, T: Transport> {
  clock: C,
  transport: T,
  cfg: Config,

  registry: Registry,
  observe: Observe,
  exchange: Exchange,

  conn: ConnStatus,
  details: Details,
  security: SecurityMirror,
  server: ServerMirror,
  location: Vec<String>,

  active: Active,
  outcome: Outcome,

  in_buf: Vec<u8>,
  out_buf: Vec<u8>,
  payload_buf: Vec<u8>,
  out_pending: Option<usize>,

  token_counter: u32,
  send_queue: VecDeque<QueuedSend>,

  update_requested: bool,
  update_with_payload: bool,
  update_with_lifetime: bool,
  bootstrap_requested: bool,
  restart_requested: bool,
  disable_for_ms: Option<u64>,
  suspend_until: Option<u64>,
  shutdown_phase: ShutdownPhase,
  last_activity: u64,
  bootstrap_finished: bool,

  #[cfg(feature = "composite")]
  pending_composite_observe: bool,
  #[cfg(feature = "composite")]
  pending_observe_token: Token,

  on_status: Option<Box<dyn FnMut(ConnStatus)>>,
}

impl<C: Clock, T: Transport> fmt::Debug for Session<C, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Session")
     .field("conn", &self.conn)
     .field("endpoint", &self.cfg.endpoint)
     .field("exchange", &self.exchange.state())
     .finish()
  }
}

impl<C: Clock, T: Transport> Session<C, T> {
  /// Create a session. Fails on an invalid configuration; objects are
  /// added afterwards through [`Session::register_object`].
  pub fn new(cfg: Config, clock: C, transport: T) -> Result<Self, Error> {
    if !cfg.valid() {
      return Err(Error::InvalidConfig);
    }

    let seed = cfg.endpoint
                  .bytes()
                  .fold(0x6E_65_77_74u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let exchange = Exchange::new(cfg.tx_params, cfg.server_request_timeout_ms, seed);

    let mut in_buf = Vec::new();
    in_buf.resize(cfg.msg_buffer_size, 0);
    let mut out_buf = Vec::new();
    out_buf.resize(cfg.msg_buffer_size, 0);
    let mut payload_buf = Vec::new();
    payload_buf.resize(cfg.payload_buffer_size, 0);

    Ok(Self { clock,
              transport,
              cfg,
              registry: Registry::new(),
              observe: Observe::new(),
              exchange,
              conn: ConnStatus::Initial,
              details: Details::None,
              security: SecurityMirror::default(),
              server: ServerMirror::default(),
              location: Vec::new(),
              active: Active::None,
              outcome: Outcome::default(),
              in_buf,
              out_buf,
              payload_buf,
              out_pending: None,
              token_counter: 0,
              send_queue: VecDeque::new(),
              update_requested: false,
              update_with_payload: false,
              update_with_lifetime: false,
              bootstrap_requested: false,
              restart_requested: false,
              disable_for_ms: None,
              suspend_until: None,
              shutdown_phase: ShutdownPhase::None,
              last_activity: 0,
              bootstrap_finished: false,
              #[cfg(feature = "composite")]
              pending_composite_observe: false,
              #[cfg(feature = "composite")]
              pending_observe_token: Token::default(),
              on_status: None })
  }

  /// Install a connection-status callback.
  pub fn on_status_change(&mut self, cb: impl FnMut(ConnStatus) + 'static) {
    self.on_status = Some(Box::new(cb));
  }

  /// Add an object to the data model.
  pub fn register_object(&mut self,
                         def: ObjDef,
                         handlers: Box<dyn ObjHandlers>)
                         -> Result<(), Error> {
    self.registry.add(def, handlers)
  }

  /// Remove an object from the data model.
  pub fn remove_object(&mut self, oid: u16) -> Result<(), Error> {
    self.registry.remove(oid)
  }

  /// Current connection status.
  pub fn conn_status(&self) -> ConnStatus {
    self.conn
  }

  /// The stored registration Location-Path.
  pub fn registration_location(&self) -> &[String] {
    &self.location
  }

  /// Whether an exchange with the server is in flight. The data model
  /// must not be mutated while this returns true.
  pub fn ongoing_operation(&self) -> bool {
    self.exchange.ongoing()
  }

  fn now(&self) -> u64 {
    self.clock
        .try_now()
        .map(since_epoch)
        .unwrap_or(0)
  }

  fn set_conn(&mut self, status: ConnStatus) {
    if self.conn != status {
      log::info!("conn status {:?} -> {:?}", self.conn, status);
      self.conn = status;
      if let Some(cb) = self.on_status.as_mut() {
        cb(status);
      }
    }
  }

  fn fresh_token(&mut self) -> Token {
    self.token_counter = self.token_counter.wrapping_add(1);
    Token::from_bytes(&self.token_counter.to_be_bytes()).unwrap_or_default()
  }

  /// Run one non-blocking tick: pump the transport, drive the exchange
  /// timers, advance the conn-status machine.
  pub fn step(&mut self) {
    let now = self.now();

    if self.restart_requested {
      self.do_restart();
    }

    self.pump(now);
    self.drive(now);
    self.pump(now);
  }

  /// Milliseconds until the next [`Session::step`] is needed; 0 when
  /// there is immediate work.
  pub fn next_step_time(&self) -> u64 {
    if self.out_pending.is_some() || self.restart_requested {
      return 0;
    }

    let now = self.now();
    let mut soonest: Option<u64> = None;
    let mut consider_abs = |at: u64| {
      let dt = at.saturating_sub(now);
      soonest = Some(soonest.map(|s| s.min(dt)).unwrap_or(dt));
    };

    if let Some(at) = self.exchange.next_wakeup() {
      consider_abs(at);
    }

    match self.details {
      | Details::Registration { retry_at, .. } => consider_abs(retry_at),
      | Details::Registered { next_update_at } => consider_abs(next_update_at),
      | Details::Bootstrap { retry_at, deadline, .. } => {
        consider_abs(retry_at);
        consider_abs(deadline);
      },
      | Details::None => {},
    }

    if let Some(until) = self.suspend_until {
      consider_abs(until);
    }

    if let Some(due_in) = self.observe.next_due_in(now) {
      consider_abs(now + due_in);
    }

    if self.cfg.queue_mode_enabled && self.conn == ConnStatus::Registered {
      consider_abs(self.last_activity + self.cfg.queue_mode_timeout_ms());
    }

    match self.conn {
      | ConnStatus::Failure | ConnStatus::Invalid => u64::MAX,
      | ConnStatus::Initial | ConnStatus::Bootstrapped => 0,
      | _ => soonest.unwrap_or(0),
    }
  }

  /// Report a user-originated data-model change. This is the sole
  /// source of value-changed / added / removed events outside server
  /// writes; skipping it breaks notifications and update scheduling.
  pub fn data_model_changed(&mut self, path: &UriPath, kind: ChangeKind) {
    self.observe.data_model_changed(path, kind);

    if matches!(kind, ChangeKind::Added | ChangeKind::Deleted) && path.len() == 2 {
      self.update_requested = true;
      self.update_with_payload = true;
    }
  }

  /// Disable the server connection for `timeout_ms`: de-register, then
  /// sleep in `Suspended` until the window expires.
  pub fn disable_server(&mut self, timeout_ms: u64) {
    self.disable_for_ms = Some(timeout_ms);
  }

  /// Force a client-initiated bootstrap sequence.
  pub fn request_bootstrap(&mut self) {
    if self.conn != ConnStatus::Bootstrapping {
      self.bootstrap_requested = true;
    }
  }

  /// Force a Registration Update.
  pub fn request_update(&mut self) {
    if self.conn == ConnStatus::Registered || self.conn == ConnStatus::QueueMode {
      self.update_requested = true;
    }
  }

  /// Reset to `Initial`, de-registering first when registered.
  pub fn restart(&mut self) {
    self.restart_requested = true;
  }

  /// Queue an LwM2M Send of the current values under `paths`.
  pub fn send(&mut self, paths: &[UriPath], confirmable: bool) -> Result<(), Error> {
    if self.server.mute_send {
      return Err(Error::NotSupported);
    }
    if self.send_queue.len() >= SEND_QUEUE_MAX {
      return Err(Error::Buffer);
    }

    let mut doc = String::new();
    for path in paths {
      let value = self.registry.res_read(path).map_err(Error::Coap)?;
      senml::encode_entry(&mut doc, path, &value);
    }

    self.send_queue.push_back(QueuedSend { doc: doc.into_bytes(),
                                           confirmable });
    Ok(())
  }

  /// Tear the session down: de-register when registered, shut the
  /// transport. Returns [`Error::Again`] while teardown is still in
  /// progress; call again until it returns `Ok`.
  pub fn shutdown(&mut self) -> Result<(), Error> {
    let now = self.now();

    if self.shutdown_phase == ShutdownPhase::None {
      self.shutdown_phase = if self.conn == ConnStatus::Registered && !self.location.is_empty()
      {
        ShutdownPhase::Deregister
      } else {
        ShutdownPhase::NetShutdown
      };
      self.send_queue.clear();
      self.observe.clear();
    }

    match self.shutdown_phase {
      | ShutdownPhase::Deregister => {
        if !self.exchange.ongoing() && matches!(self.active, Active::None) {
          self.start_deregister(now);
        }
        self.pump(now);
        if self.shutdown_phase == ShutdownPhase::Deregister {
          return Err(Error::Again);
        }
        self.shutdown()
      },
      | ShutdownPhase::NetShutdown => {
        if self.exchange.ongoing() {
          self.cancel_exchange(now);
        }
        match self.transport.shutdown() {
          | Ok(()) => {
            self.shutdown_phase = ShutdownPhase::Close;
            self.shutdown()
          },
          | Err(nb::Error::WouldBlock) => Err(Error::Again),
          | Err(nb::Error::Other(_)) => {
            self.shutdown_phase = ShutdownPhase::Close;
            self.shutdown()
          },
        }
      },
      | ShutdownPhase::Close => {
        self.transport.close();
        self.shutdown_phase = ShutdownPhase::Done;
        Ok(())
      },
      | ShutdownPhase::Done => Ok(()),
      | ShutdownPhase::None => Ok(()),
    }
  }

  // ---- internal machinery ----

  fn exchange_event(&mut self, ev: Event<'_, '_>, now: u64) {
    let mut glue = Glue { active: &mut self.active,
                          registry: &mut self.registry,
                          outcome: &mut self.outcome };
    self.exchange.process(ev, &mut glue, &mut self.payload_buf, now);
  }

  fn exchange_send_failed(&mut self) {
    let mut glue = Glue { active: &mut self.active,
                          registry: &mut self.registry,
                          outcome: &mut self.outcome };
    self.exchange.send_failed(&mut glue);
  }

  fn cancel_exchange(&mut self, now: u64) {
    self.exchange_event(Event::Cancel, now);
    self.handle_outcome(now);
  }

  fn pump(&mut self, now: u64) {
    // flush a datagram stuck on a previous WouldBlock
    if let Some(len) = self.out_pending {
      match self.transport.send(&self.out_buf[..len]) {
        | Ok(_) => {
          self.out_pending = None;
          self.last_activity = now;
          self.exchange_event(Event::SendConfirmation, now);
          self.handle_outcome(now);
        },
        | Err(nb::Error::WouldBlock) => return,
        | Err(nb::Error::Other(_)) => {
          self.out_pending = None;
          self.exchange_send_failed();
          self.handle_outcome(now);
        },
      }
    }

    // drain the receive queue
    if self.transport.state() == TransportState::Connected {
      let mut in_buf = mem::take(&mut self.in_buf);
      loop {
        match self.transport.recv(&mut in_buf) {
          | Ok(n) => match decode_udp(&in_buf[..n]) {
            | Ok(msg) => self.route(&msg, now),
            | Err(e) => log::debug!("dropping undecodable datagram: {:?}", e),
          },
          | Err(nb::Error::WouldBlock) => break,
          | Err(nb::Error::Other(e)) => {
            log::warn!("transport recv error: {:?}", e);
            if self.exchange.ongoing() {
              self.exchange_send_failed();
              self.handle_outcome(now);
            }
            break;
          },
        }
      }
      self.in_buf = in_buf;
    }

    // run exchange timers
    if self.exchange.ongoing() {
      self.exchange_event(Event::None, now);
      self.handle_outcome(now);
    }

    self.flush_exchange(now);
  }

  fn flush_exchange(&mut self, now: u64) {
    while self.exchange.state() == State::MsgToSend && self.out_pending.is_none() {
      let mut out_buf = mem::take(&mut self.out_buf);
      let encoded = self.encode_current(&mut out_buf);
      self.out_buf = out_buf;

      let len = match encoded {
        | Ok(len) => len,
        | Err(e) => {
          log::error!("cannot encode outgoing message: {:?}", e);
          self.exchange_send_failed();
          self.handle_outcome(now);
          break;
        },
      };

      match self.transport.send(&self.out_buf[..len]) {
        | Ok(_) => {
          self.last_activity = now;
          self.exchange_event(Event::SendConfirmation, now);
          self.handle_outcome(now);
        },
        | Err(nb::Error::WouldBlock) => {
          self.out_pending = Some(len);
          break;
        },
        | Err(nb::Error::Other(e)) => {
          log::warn!("transport send error: {:?}", e);
          self.exchange_send_failed();
          self.handle_outcome(now);
          break;
        },
      }
    }
  }

  fn encode_current(&self, out: &mut [u8]) -> Result<usize, newt_msg::EncodeError> {
    let meta = self.exchange.current();
    let payload_len = self.exchange.payload_len();

    let location_refs: Vec<&str> = self.location.iter().map(String::as_str).collect();

    let attrs: Attrs<'_> = match meta.operation {
      | Operation::Register => {
        Attrs::Register(RegisterAttrs { endpoint: Some(&self.cfg.endpoint),
                                        lifetime: Some(self.server.lifetime_s),
                                        lwm2m_ver: Some(LWM2M_VERSION),
                                        binding: Some("U"),
                                        sms_number: None,
                                        queue_mode: self.cfg.queue_mode_enabled })
      },
      | Operation::Update => {
        Attrs::Register(RegisterAttrs { lifetime: self.update_with_lifetime
                                                      .then_some(self.server.lifetime_s),
                                        ..RegisterAttrs::default() })
      },
      | Operation::BootstrapReq => {
        Attrs::Bootstrap(BootstrapAttrs { endpoint: Some(&self.cfg.endpoint),
                                          preferred_content_format: None })
      },
      | _ => match meta.created {
        | Some((oid, iid)) => Attrs::CreateAck(CreateAttrs { oid, iid }),
        | None => Attrs::None,
      },
    };

    let location_path = match meta.operation {
      | Operation::Update | Operation::Deregister => {
        LocationPath::from_segments(&location_refs).unwrap_or_default()
      },
      | _ => LocationPath::default(),
    };

    let msg = Message { operation: meta.operation,
                        code: meta.code,
                        token: meta.token,
                        uri: meta.uri,
                        content_format: meta.content_format,
                        accept: meta.accept,
                        observe: meta.observe,
                        block: meta.block,
                        etag: Default::default(),
                        location_path,
                        attrs,
                        payload: &self.payload_buf[..payload_len],
                        binding: Binding::Udp { id: meta.msg_id, ty: meta.msg_type },
                        signalling: Default::default() };

    encode_udp(&msg, out)
  }

  fn route(&mut self, msg: &Message<'_>, now: u64) {
    self.last_activity = now;

    if let Details::Bootstrap { deadline, .. } = &mut self.details {
      *deadline = now + self.cfg.bootstrap_timeout_s as u64 * 1000;
    }

    if self.exchange.ongoing() {
      self.exchange_event(Event::NewMsg(msg), now);
      self.handle_outcome(now);
      return;
    }

    if msg.code.kind() == CodeKind::Request {
      self.start_server_exchange(msg, now);
    }
  }

  fn start_server_exchange(&mut self, msg: &Message<'_>, now: u64) {
    let bootstrap = self.conn == ConnStatus::Bootstrapping;
    let ssid = self.server.ssid;

    let serving = matches!(self.conn,
                           ConnStatus::Registered
                           | ConnStatus::Bootstrapping
                           | ConnStatus::Registering
                           | ConnStatus::EnteringQueueMode);
    if !serving {
      self.respond_error(msg, Code::SERVICE_UNAVAILABLE, now);
      return;
    }

    let mut observe_initial = false;

    let code = match msg.operation {
      | Operation::BootstrapFinish if bootstrap => {
        let ok = self.registry.has_regular_server();
        self.active = Active::Doc { kind: DocKind::BootstrapFinishAck { ok },
                                    stream: DocStream::empty() };
        if ok {
          Code::CHANGED
        } else {
          Code::NOT_ACCEPTABLE
        }
      },
      | Operation::BootstrapFinish => Code::UNAUTHORIZED,
      | Operation::DmWriteAttr => {
        let attrs = msg.attrs.notification().copied().unwrap_or_default();
        self.write_attr_transactional(ssid, msg.uri, &attrs)
      },
      | Operation::InfObserve => {
        match DmOp::begin(&mut self.registry, msg, bootstrap, &|_| None) {
          | Ok(op) => {
            let attrs = msg.attrs.notification().copied().unwrap_or_default();
            match self.observe.observe(ssid,
                                       msg.token,
                                       msg.uri,
                                       &attrs,
                                       msg.accept,
                                       &self.server.observe_state,
                                       &mut self.registry,
                                       now)
            {
              | Ok(_) => {
                observe_initial = true;
                self.active = Active::Dm(op);
                op_success(&self.active)
              },
              | Err(code) => code,
            }
          },
          | Err(code) => code,
        }
      },
      | Operation::InfCancelObserve => {
        self.observe.cancel_by_token(&msg.token);
        match DmOp::begin(&mut self.registry, msg, bootstrap, &|_| None) {
          | Ok(op) => {
            self.active = Active::Dm(op);
            op_success(&self.active)
          },
          | Err(code) => code,
        }
      },
      #[cfg(feature = "composite")]
      | Operation::InfCancelObserveComp => {
        self.observe.cancel_by_token(&msg.token);
        Code::CHANGED
      },
      | _ => {
        // plain data-model traffic, incl. composite reads / writes and
        // composite observe (registered at completion)
        let observe = &self.observe;
        let attr_lookup = |p: &UriPath| observe.attr_record(ssid, p);
        match DmOp::begin(&mut self.registry, msg, bootstrap, &attr_lookup) {
          | Ok(op) => {
            #[cfg(feature = "composite")]
            if msg.operation == Operation::InfObserveComp {
              observe_initial = true;
              self.pending_composite_observe = true;
              self.pending_observe_token = msg.token;
            }
            self.active = Active::Dm(op);
            op_success(&self.active)
          },
          | Err(code) => code,
        }
      },
    };

    let mut glue = Glue { active: &mut self.active,
                          registry: &mut self.registry,
                          outcome: &mut self.outcome };
    self.exchange
        .new_server_request(code, msg, &mut glue, &mut self.payload_buf, now);
    if observe_initial && !code.is_error() {
      self.exchange.set_observe(0);
    }
    self.handle_outcome(now);
  }

  /// Write-Attributes is a mutating operation: the addressed object gets
  /// the same begin / validate / end bracket as any other write, even
  /// though the attribute records live in the observe engine.
  fn write_attr_transactional(&mut self,
                              ssid: u16,
                              path: UriPath,
                              attrs: &NotificationAttrs)
                              -> Code {
    let oid = path.oid();

    let mut opened = false;
    if let Some(entry) = oid.and_then(|oid| self.registry.entry_mut(oid)) {
      if let Err(code) = entry.handlers.transaction_begin() {
        return code;
      }
      entry.in_transaction = true;
      opened = true;
    }

    let mut code = match self.observe.write_attr(ssid,
                                                 path,
                                                 attrs,
                                                 &self.server.observe_state,
                                                 &mut self.registry)
    {
      | Ok(()) => Code::CHANGED,
      | Err(code) => code,
    };

    if opened {
      if let Some(entry) = oid.and_then(|oid| self.registry.entry_mut(oid)) {
        if !code.is_error() {
          if let Err(validate) = entry.handlers.transaction_validate() {
            code = validate;
          }
        }
        entry.handlers.transaction_end(!code.is_error());
        entry.in_transaction = false;
      }
    }

    code
  }

  fn respond_error(&mut self, msg: &Message<'_>, code: Code, now: u64) {
    self.active = Active::None;
    let mut glue = Glue { active: &mut self.active,
                          registry: &mut self.registry,
                          outcome: &mut self.outcome };
    self.exchange
        .new_server_request(code, msg, &mut glue, &mut self.payload_buf, now);
    self.handle_outcome(now);
  }

  fn handle_outcome(&mut self, now: u64) {
    let Some(result) = self.outcome.result.take() else { return };
    let code = self.outcome.response_code.take();
    let location = mem::take(&mut self.outcome.location);
    let active = mem::replace(&mut self.active, Active::None);

    match active {
      | Active::Doc { kind: DocKind::Register, .. } => match (result, code) {
        | (Ok(()), Some(Code::CREATED)) => {
          self.location = location;
          self.enter_registered(now);
        },
        | _ => self.registration_failure(now),
      },
      | Active::Doc { kind: DocKind::Update, .. } => match result {
        | Ok(()) => self.enter_registered(now),
        | Err(_) => {
          // a failed update falls back to a full registration
          log::warn!("registration update failed; re-registering");
          self.location.clear();
          self.begin_registration(now);
        },
      },
      | Active::Doc { kind: DocKind::Deregister, .. } => {
        self.after_deregister(now);
      },
      | Active::Doc { kind: DocKind::BootstrapReq, .. } => match result {
        | Ok(()) => {
          log::info!("bootstrap request accepted; waiting for server writes");
        },
        | Err(_) => self.bootstrap_failure(now),
      },
      | Active::Doc { kind: DocKind::Notify { slot }, .. } => {
        self.observe.notify_result(slot, now, result);
      },
      | Active::Doc { kind: DocKind::Send, .. } => {
        self.send_queue.pop_front();
        if let Err(e) = result {
          log::warn!("send failed: {:?}", e);
        }
      },
      | Active::Doc { kind: DocKind::BootstrapFinishAck { ok }, .. } => {
        if ok && result.is_ok() {
          self.bootstrap_finished = true;
        } else if !ok {
          self.bootstrap_failure(now);
        }
      },
      | Active::Dm(op) => {
        self.after_dm(op, result.is_ok(), now);
      },
      | Active::None => {},
    }
  }

  fn after_dm(&mut self, op: DmOp, success: bool, now: u64) {
    #[cfg(feature = "composite")]
    {
      let wanted = mem::replace(&mut self.pending_composite_observe, false);
      if wanted && success && !op.composite_paths().is_empty() {
        // a successful composite observe registers its chain now
        let _ = self.observe.observe_composite(self.server.ssid,
                                               self.pending_observe_token,
                                               op.composite_paths(),
                                               None,
                                               &self.server.observe_state,
                                               &mut self.registry,
                                               now);
      }
    }

    if !success {
      return;
    }

    // a server-written lifetime takes effect through an update
    if op.operation().is_write_like()
       && op.path().oid() == Some(crate::dm::oid::SERVER)
       && (op.path().rid() == Some(crate::dm::server_rid::LIFETIME) || op.path().len() <= 2)
    {
      if let Ok(server) = mirror::server_mirror(&mut self.registry, self.server.ssid) {
        if server.lifetime_s != self.server.lifetime_s {
          self.server.lifetime_s = server.lifetime_s;
          self.update_requested = true;
          self.update_with_lifetime = true;
        }
      }
    }

    if let Some(path) = op.executed() {
      use crate::dm::{oid, server_rid};
      if path.oid() == Some(oid::SERVER) {
        match path.rid() {
          | Some(server_rid::DISABLE) => {
            let timeout_s =
              self.registry
                  .res_read(&UriPath::resource(oid::SERVER,
                                               path.iid().unwrap_or(0),
                                               server_rid::DISABLE_TIMEOUT))
                  .ok()
                  .and_then(|v| v.as_u32())
                  .unwrap_or(86400);
            self.disable_for_ms = Some(timeout_s as u64 * 1000);
          },
          | Some(server_rid::UPDATE_TRIGGER) => self.update_requested = true,
          | Some(server_rid::BOOTSTRAP_TRIGGER) => self.bootstrap_requested = true,
          | _ => {},
        }
      }
    }

    let _ = now;
  }

  // ---- conn-status machine ----

  fn drive(&mut self, now: u64) {
    // a tick may chain several transitions (e.g. Suspended → Initial →
    // Registering); run until the status settles
    for _ in 0..4 {
      let before = self.conn;

      match self.conn {
        | ConnStatus::Initial => self.drive_initial(now),
        | ConnStatus::Invalid => self.set_conn(ConnStatus::Failure),
        | ConnStatus::Failure => {},
        | ConnStatus::Bootstrapping => self.drive_bootstrapping(now),
        | ConnStatus::Bootstrapped => self.drive_bootstrapped(now),
        | ConnStatus::Registering => self.drive_registering(now),
        | ConnStatus::Registered => self.drive_registered(now),
        | ConnStatus::Suspended => {
          if self.suspend_until.map(|at| now >= at).unwrap_or(false) {
            self.suspend_until = None;
            self.set_conn(ConnStatus::Initial);
          }
        },
        | ConnStatus::EnteringQueueMode => {
          match self.transport.shutdown() {
            | Err(nb::Error::WouldBlock) => {},
            | _ => {
              self.transport.close();
              self.server.observe_state.online = false;
              self.set_conn(ConnStatus::QueueMode);
            },
          }
        },
        | ConnStatus::QueueMode => self.drive_queue_mode(now),
      }

      if self.conn == before {
        break;
      }
    }
  }

  fn drive_initial(&mut self, now: u64) {
    if !self.cfg.valid() || self.registry.object_count() == 0 {
      self.set_conn(ConnStatus::Invalid);
      return;
    }

    match mirror::pick_targets(&mut self.registry) {
      | Ok((security, Some(server))) if !self.bootstrap_requested => {
        self.security = security;
        self.server = server;
        self.begin_registration(now);
      },
      | Ok((_, _)) => {
        // bootstrap required (either no regular pair, or requested)
        match self.pick_bootstrap_target() {
          | Ok(security) => {
            let hold_off = security.hold_off_s as u64 * 1000;
            self.security = security;
            self.bootstrap_requested = false;
            self.details = Details::Bootstrap { attempt: 0,
                                                retry_at: now + hold_off,
                                                deadline: now
                                                          + self.cfg.bootstrap_timeout_s as u64
                                                            * 1000,
                                                requested: false };
            self.bootstrap_finished = false;
            self.set_conn(ConnStatus::Bootstrapping);
          },
          | Err(_) => self.set_conn(ConnStatus::Invalid),
        }
      },
      | Err(_) => self.set_conn(ConnStatus::Invalid),
    }
  }

  fn pick_bootstrap_target(&mut self) -> Result<SecurityMirror, Error> {
    let instances = self.registry.security_instances();
    for (iid, is_bs) in instances {
      if is_bs {
        return mirror::security_mirror(&mut self.registry, iid, true);
      }
    }
    Err(Error::InvalidConfig)
  }

  fn begin_registration(&mut self, now: u64) {
    self.details = Details::Registration { attempt: 0, seq: 0, retry_at: now };
    self.set_conn(ConnStatus::Registering);
  }

  fn connect_transport(&mut self) -> bool {
    match self.transport.state() {
      | TransportState::Connected => true,
      | _ => {
        let host = self.security.host.clone();
        let port = self.security.port;
        match self.transport.connect(&host, port) {
          | Ok(()) => true,
          | Err(nb::Error::WouldBlock) => false,
          | Err(nb::Error::Other(e)) => {
            log::warn!("connect failed: {:?}", e);
            false
          },
        }
      },
    }
  }

  fn drive_registering(&mut self, now: u64) {
    if self.exchange.ongoing() || !matches!(self.active, Active::None) {
      return;
    }

    let Details::Registration { retry_at, .. } = self.details else {
      self.details = Details::Registration { attempt: 0, seq: 0, retry_at: now };
      return;
    };

    if now < retry_at || !self.connect_transport() {
      return;
    }

    let meta = MsgMeta { operation: Operation::Register,
                         code: Code::POST,
                         token: self.fresh_token(),
                         content_format: Some(ContentFormat::LINK_FORMAT),
                         ..MsgMeta::default() };
    let doc = linkfmt::register_payload(&self.registry);
    self.start_client_doc(DocKind::Register, meta, doc, Some(ContentFormat::LINK_FORMAT), now);
  }

  fn registration_failure(&mut self, now: u64) {
    let Details::Registration { mut attempt, mut seq, .. } = self.details else {
      self.set_conn(ConnStatus::Failure);
      return;
    };

    attempt += 1;
    if attempt < self.server.retry.retry_count {
      let backoff = self.server.retry.retry_timer as u64 * (1u64 << (attempt - 1)) * 1000;
      log::warn!("registration attempt {} failed; retrying in {} ms", attempt, backoff);
      self.details = Details::Registration { attempt, seq, retry_at: now + backoff };
      return;
    }

    seq += 1;
    if seq < self.server.retry.seq_retry_count {
      let delay = self.server.retry.seq_delay_timer as u64 * 1000;
      log::warn!("registration sequence failed; next sequence in {} ms", delay);
      self.details = Details::Registration { attempt: 0, seq, retry_at: now + delay };
      return;
    }

    if self.server.bootstrap_on_failure {
      log::warn!("registration retries exhausted; falling back to bootstrap");
      self.bootstrap_requested = true;
      self.transport.close();
      self.set_conn(ConnStatus::Initial);
    } else {
      self.transport.close();
      self.set_conn(ConnStatus::Failure);
    }
  }

  fn drive_bootstrapping(&mut self, now: u64) {
    let Details::Bootstrap { attempt, retry_at, deadline, requested } = self.details else {
      return;
    };

    if self.bootstrap_finished && !self.exchange.ongoing() {
      self.set_conn(ConnStatus::Bootstrapped);
      return;
    }

    if now >= deadline {
      log::warn!("bootstrap inactivity timeout");
      self.bootstrap_failure(now);
      return;
    }

    if self.exchange.ongoing() || requested || now < retry_at {
      return;
    }

    if !self.connect_transport() {
      return;
    }

    let meta = MsgMeta { operation: Operation::BootstrapReq,
                         code: Code::POST,
                         token: self.fresh_token(),
                         ..MsgMeta::default() };
    self.details = Details::Bootstrap { attempt, retry_at, deadline, requested: true };
    self.start_client_doc(DocKind::BootstrapReq, meta, Vec::new(), None, now);
  }

  fn bootstrap_failure(&mut self, now: u64) {
    let Details::Bootstrap { attempt, .. } = self.details else {
      self.set_conn(ConnStatus::Failure);
      return;
    };

    self.registry.bootstrap_cleanup();

    let attempt = attempt + 1;
    if attempt < self.cfg.bootstrap_retry_count {
      let backoff = self.cfg.bootstrap_retry_timeout_s as u64 * (1u64 << (attempt - 1)) * 1000;
      self.details = Details::Bootstrap { attempt,
                                          retry_at: now + backoff,
                                          deadline: now
                                                    + backoff
                                                    + self.cfg.bootstrap_timeout_s as u64 * 1000,
                                          requested: false };
      return;
    }

    self.transport.close();
    self.set_conn(ConnStatus::Failure);
  }

  fn drive_bootstrapped(&mut self, _now: u64) {
    // pick up the provisioned Security / Server pair and register
    self.transport.close();
    self.set_conn(ConnStatus::Initial);
  }

  fn enter_registered(&mut self, now: u64) {
    self.update_requested = false;
    self.update_with_payload = false;
    self.update_with_lifetime = false;
    self.server.observe_state.online = true;
    self.details = Details::Registered { next_update_at: now + self.update_margin_ms() };
    self.set_conn(ConnStatus::Registered);
  }

  fn update_margin_ms(&self) -> u64 {
    let lifetime_ms = self.server.lifetime_s as u64 * 1000;
    let margin = self.cfg.tx_params.max_transmit_wait_ms();
    (lifetime_ms / 2).max(lifetime_ms.saturating_sub(margin))
  }

  fn drive_registered(&mut self, now: u64) {
    if self.exchange.ongoing() || !matches!(self.active, Active::None) {
      return;
    }

    // priority: registration update > de-register (disable / bootstrap
    // trigger) > send > notify > queue mode
    let update_due = match self.details {
      | Details::Registered { next_update_at } => now >= next_update_at,
      | _ => false,
    };
    if (update_due || self.update_requested)
       && self.disable_for_ms.is_none()
       && !self.bootstrap_requested
    {
      self.start_update(now);
      return;
    }

    if self.disable_for_ms.is_some() || self.bootstrap_requested {
      self.start_deregister(now);
      return;
    }

    if let Some(front) = self.send_queue.front() {
      let confirmable = front.confirmable;
      let doc = front.doc.clone();
      let meta = MsgMeta { operation: if confirmable {
                             Operation::InfConSend
                           } else {
                             Operation::InfNonConSend
                           },
                           code: Code::POST,
                           token: self.fresh_token(),
                           content_format: Some(ContentFormat::SENML_JSON),
                           ..MsgMeta::default() };
      self.start_client_doc(DocKind::Send, meta, doc, Some(ContentFormat::SENML_JSON), now);
      return;
    }

    if let Some(plan) = self.observe
                            .process(now, &self.server.observe_state, &mut self.registry)
    {
      let meta = MsgMeta { operation: if plan.confirmable {
                             Operation::InfConNotify
                           } else {
                             Operation::InfNonConNotify
                           },
                           code: Code::CONTENT,
                           token: plan.token,
                           observe: Some(plan.observe_number),
                           content_format: Some(plan.format),
                           ..MsgMeta::default() };
      self.start_client_doc(DocKind::Notify { slot: plan.slot },
                            meta,
                            plan.payload,
                            Some(plan.format),
                            now);
      return;
    }

    if self.cfg.queue_mode_enabled
       && now.saturating_sub(self.last_activity) >= self.cfg.queue_mode_timeout_ms()
    {
      log::debug!("queue mode: transport idle, going offline");
      self.set_conn(ConnStatus::EnteringQueueMode);
    }
  }

  fn drive_queue_mode(&mut self, now: u64) {
    let update_due = match self.details {
      | Details::Registered { next_update_at } => now >= next_update_at,
      | _ => false,
    };
    let work = update_due
               || self.update_requested
               || !self.send_queue.is_empty()
               || self.observe.next_due_in(now) == Some(0)
               || self.disable_for_ms.is_some()
               || self.bootstrap_requested;
    if !work {
      return;
    }

    let _ = self.transport.reuse_last_port();
    if self.connect_transport() {
      self.last_activity = now;
      self.server.observe_state.online = true;
      self.set_conn(ConnStatus::Registered);
    }
  }

  fn start_client_doc(&mut self,
                      kind: DocKind,
                      meta: MsgMeta,
                      doc: Vec<u8>,
                      format: Option<ContentFormat>,
                      now: u64) {
    self.active = Active::Doc { kind,
                                stream: DocStream::new(doc, format) };
    let mut glue = Glue { active: &mut self.active,
                          registry: &mut self.registry,
                          outcome: &mut self.outcome };
    self.exchange
        .new_client_request(meta, &mut glue, &mut self.payload_buf, now);
    self.handle_outcome(now);
  }

  fn start_update(&mut self, now: u64) {
    let meta = MsgMeta { operation: Operation::Update,
                         code: Code::POST,
                         token: self.fresh_token(),
                         content_format: self.update_with_payload
                                             .then_some(ContentFormat::LINK_FORMAT),
                         ..MsgMeta::default() };
    let doc = if self.update_with_payload {
      linkfmt::register_payload(&self.registry)
    } else {
      Vec::new()
    };
    let format = self.update_with_payload.then_some(ContentFormat::LINK_FORMAT);
    self.start_client_doc(DocKind::Update, meta, doc, format, now);
  }

  fn start_deregister(&mut self, now: u64) {
    let meta = MsgMeta { operation: Operation::Deregister,
                         code: Code::DELETE,
                         token: self.fresh_token(),
                         ..MsgMeta::default() };
    self.start_client_doc(DocKind::Deregister, meta, Vec::new(), None, now);
  }

  fn after_deregister(&mut self, now: u64) {
    self.location.clear();
    self.server.observe_state.online = false;

    if self.shutdown_phase == ShutdownPhase::Deregister {
      self.shutdown_phase = ShutdownPhase::NetShutdown;
      return;
    }

    if let Some(window) = self.disable_for_ms.take() {
      self.transport.close();
      self.suspend_until = Some(now + window);
      self.set_conn(ConnStatus::Suspended);
      return;
    }

    if self.bootstrap_requested {
      self.transport.close();
      self.set_conn(ConnStatus::Initial);
      return;
    }

    self.transport.close();
    self.set_conn(ConnStatus::Initial);
  }

  fn do_restart(&mut self) {
    let now = self.now();
    log::info!("session restart requested");
    self.restart_requested = false;

    if self.exchange.ongoing() {
      self.cancel_exchange(now);
    }
    self.transport.close();
    self.observe.clear();
    self.send_queue.clear();
    self.location.clear();
    self.out_pending = None;
    self.active = Active::None;
    self.details = Details::None;
    self.suspend_until = None;
    self.disable_for_ms = None;
    self.shutdown_phase = ShutdownPhase::None;
    self.set_conn(ConnStatus::Initial);
  }
}

fn op_success(active: &Active) -> Code {
  match active {
    | Active::Dm(op) => op.success_code(),
    | _ => Code::CHANGED,
  }
}
