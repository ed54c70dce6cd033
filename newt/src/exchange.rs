use newt_msg::{Block, BlockKind, Code, ContentFormat, Id, Message, Operation, Token, Type};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::TxParams;
use crate::error::Error;

/// Exchange lifecycle state. The engine performs no I/O itself: the owner
/// polls, inspects the state, and acts.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum State {
  /// A message descriptor is ready; encode and send it, then feed
  /// [`Event::SendConfirmation`].
  MsgToSend,
  /// The owner is transmitting; the engine waits for the confirmation.
  WaitingSendConfirm,
  /// Waiting for the peer: a response, the next block, or a timeout.
  WaitingMsg,
  /// Nothing in flight; also the idle state.
  #[default]
  Finished,
}

/// Input to one [`Exchange::process`] step.
#[derive(Debug)]
pub enum Event<'a, 'm> {
  /// Nothing happened; check timers.
  None,
  /// The owner finished sending the current message.
  SendConfirmation,
  /// A decoded message arrived from the peer.
  NewMsg(&'a Message<'m>),
  /// Abort the exchange; completion fires with [`Error::Terminated`].
  Cancel,
}

/// Which side opened this exchange.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Role {
  Client,
  Server,
}

/// Outcome of a [`Handlers::read_payload`] call.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReadOut {
  /// The body is complete; `len` bytes were written to the buffer.
  Done {
    /// Bytes produced
    len: usize,
    /// Media type of the body (None when `len == 0`)
    format: Option<ContentFormat>,
    /// For Create responses: the `(oid, iid)` to echo as Location-Path
    created: Option<(u16, u16)>,
  },
  /// The buffer is full and more body remains: send this chunk with
  /// `more = true` and call again for the next block.
  Again {
    /// Bytes produced (the full chunk)
    len: usize,
    /// Media type of the body
    format: Option<ContentFormat>,
  },
}

/// The owner's payload / completion callbacks.
///
/// `completion` is invoked exactly once per exchange. When the response
/// code passed to [`Exchange::new_server_request`] is already an error,
/// neither payload handler is called.
pub trait Handlers {
  /// Produce (a chunk of) the outgoing body into `buf`.
  fn read_payload(&mut self, _buf: &mut [u8]) -> Result<ReadOut, Code> {
    Ok(ReadOut::Done { len: 0, format: None, created: None })
  }

  /// Consume (a chunk of) the incoming body. `last_block` is true on the
  /// final chunk; any owned assembly context should be finalized then.
  fn write_payload(&mut self, _chunk: &[u8], _last_block: bool) -> Result<(), Code> {
    Ok(())
  }

  /// The exchange ended. `response` carries the final peer message only
  /// on success of a client-initiated exchange.
  fn completion(&mut self, response: Option<&Message<'_>>, result: Result<(), Error>);
}

/// Owned, header-only descriptor of the message to send next. The body
/// lives in the owner's payload buffer ([`Exchange::payload_len`] bytes).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MsgMeta {
  /// LwM2M operation to encode
  pub operation: Operation,
  /// Method / response code
  pub code: Code,
  /// Exchange token
  pub token: Token,
  /// Data-model path (requests)
  pub uri: newt_msg::UriPath,
  /// Body media type
  pub content_format: Option<ContentFormat>,
  /// Preferred response media type
  pub accept: Option<ContentFormat>,
  /// Observe option
  pub observe: Option<u32>,
  /// Block option
  pub block: Option<Block>,
  /// Create-response Location-Path echo
  pub created: Option<(u16, u16)>,
  /// UDP message id
  pub msg_id: Id,
  /// UDP message type
  pub msg_type: Type,
}

fn expects_response(op: Operation) -> bool {
  !matches!(op, Operation::InfNonConNotify | Operation::InfNonConSend)
}

/// Drives exactly one request/response interaction: retransmission with
/// jittered exponential back-off, block-wise transfer in both directions,
/// duplicate replay, separate responses, and cancellation.
///
/// State transitions are pure; the owner does the encoding, sending and
/// receiving, and reports what happened through [`Event`]s.
#[derive(Debug)]
pub struct Exchange {
  state: State,
  role: Role,
  op: Operation,
  confirmable: bool,

  base: MsgMeta,
  payload_len: usize,

  block_transfer: bool,
  block_size: u16,
  block_number: u32,

  tx: TxParams,
  server_request_timeout_ms: u64,
  retry_count: u16,
  initial_timeout_ms: u64,
  timeout_at: u64,
  rng: ChaCha8Rng,

  separate_response: bool,
  request_prepared: bool,

  /// An out-of-band reply (5.03 to an interloper, empty ACK to a
  /// separate response) that must go out without disturbing `base`.
  interject: Option<MsgMeta>,
  /// True while the message being confirmed is the interjection.
  interjecting: bool,
  /// Dedup: id of the last peer message we answered.
  last_peer_id: Option<Id>,

  completed: bool,
  next_msg_id: Id,
}

impl Exchange {
  /// An idle exchange with the given timing parameters.
  pub fn new(tx: TxParams, server_request_timeout_ms: u64, seed: u64) -> Self {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let next_msg_id = Id(rng.gen());

    Self { state: State::Finished,
           role: Role::Client,
           op: Operation::None,
           confirmable: true,
           base: MsgMeta::default(),
           payload_len: 0,
           block_transfer: false,
           block_size: 1024,
           block_number: 0,
           tx,
           server_request_timeout_ms,
           retry_count: 0,
           initial_timeout_ms: 0,
           timeout_at: u64::MAX,
           rng,
           separate_response: false,
           request_prepared: false,
           interject: None,
           interjecting: false,
           last_peer_id: None,
           completed: false,
           next_msg_id }
  }

  /// Current lifecycle state.
  pub fn state(&self) -> State {
    self.state
  }

  /// Whether an exchange is in flight.
  pub fn ongoing(&self) -> bool {
    self.state != State::Finished
  }

  /// The operation this exchange carries.
  pub fn op(&self) -> Operation {
    self.op
  }

  /// The descriptor to encode when the state is [`State::MsgToSend`]:
  /// an interjection when one is pending, the base message otherwise.
  pub fn current(&self) -> &MsgMeta {
    self.interject.as_ref().unwrap_or(&self.base)
  }

  /// Body length of the current message (always 0 for interjections).
  pub fn payload_len(&self) -> usize {
    if self.interject.is_some() {
      0
    } else {
      self.payload_len
    }
  }

  /// Whether the last ACK was empty and the real response will arrive
  /// later as a new confirmable message.
  pub fn separate_response(&self) -> bool {
    self.separate_response
  }

  /// Attach an Observe option to the response under construction
  /// (initial notify of a fresh observation).
  pub fn set_observe(&mut self, n: u32) {
    self.base.observe = Some(n);
  }

  /// Absolute deadline (owner-clock milliseconds) of the next timer, if
  /// one is armed.
  pub fn next_wakeup(&self) -> Option<u64> {
    match self.state {
      | State::WaitingMsg => Some(self.timeout_at),
      | _ => None,
    }
  }

  fn fresh_id(&mut self) -> Id {
    let id = self.next_msg_id;
    self.next_msg_id = id.next();
    id
  }

  fn attempt_timeout_ms(&mut self) -> u64 {
    if self.initial_timeout_ms == 0 {
      let factor = self.rng.gen_range(1.0..=self.tx.ack_random_factor.max(1.0));
      self.initial_timeout_ms = (self.tx.ack_timeout_ms as f64 * factor) as u64;
    }
    self.initial_timeout_ms << self.retry_count
  }

  fn negotiated_size(&self, payload_buf_len: usize) -> u16 {
    let cap = payload_buf_len.min(1024);
    let mut size = 1024u16;
    while size as usize > cap {
      size >>= 1;
    }
    size.max(16).min(self.block_size)
  }

  fn complete(&mut self,
              handlers: &mut dyn Handlers,
              response: Option<&Message<'_>>,
              result: Result<(), Error>) {
    if !self.completed {
      self.completed = true;
      handlers.completion(response, result);
    }
  }

  /// Start a client-initiated exchange. `read_payload` is invoked
  /// immediately for the request body; block-wise upload begins when it
  /// cannot fit the buffer.
  pub fn new_client_request(&mut self,
                            mut meta: MsgMeta,
                            handlers: &mut dyn Handlers,
                            payload_buf: &mut [u8],
                            now: u64) {
    self.role = Role::Client;
    self.op = meta.operation;
    self.confirmable = expects_response(meta.operation);
    self.block_transfer = false;
    self.block_size = 1024;
    self.block_number = 0;
    self.retry_count = 0;
    self.initial_timeout_ms = 0;
    self.separate_response = false;
    self.request_prepared = false;
    self.interject = None;
    self.interjecting = false;
    self.last_peer_id = None;
    self.completed = false;
    self.timeout_at = u64::MAX;
    let _ = now;

    meta.msg_id = self.fresh_id();
    meta.msg_type = if self.confirmable { Type::Con } else { Type::Non };

    match handlers.read_payload(payload_buf) {
      | Ok(ReadOut::Done { len, format, created }) => {
        self.payload_len = len;
        meta.content_format = format.or(meta.content_format);
        meta.created = created;
      },
      | Ok(ReadOut::Again { len, format }) => {
        self.payload_len = len;
        meta.content_format = format.or(meta.content_format);
        self.block_transfer = true;
        self.block_size = self.negotiated_size(payload_buf.len());
        meta.block = Some(Block::new(BlockKind::B1, 0, self.block_size, true));
      },
      | Err(code) => {
        self.state = State::Finished;
        self.complete(&mut *handlers, None, Err(Error::Coap(code)));
        return;
      },
    }

    self.base = meta;
    self.state = State::MsgToSend;
  }

  /// Start responding to a decoded server request. An error
  /// `response_code` short-circuits: no handlers run, only the error
  /// header goes out.
  pub fn new_server_request(&mut self,
                            response_code: Code,
                            request: &Message<'_>,
                            handlers: &mut dyn Handlers,
                            payload_buf: &mut [u8],
                            now: u64) {
    self.role = Role::Server;
    self.op = request.operation;
    self.confirmable = true;
    self.block_transfer = false;
    self.block_size = 1024;
    self.block_number = 0;
    self.retry_count = 0;
    self.initial_timeout_ms = 0;
    self.separate_response = false;
    self.request_prepared = false;
    self.interject = None;
    self.interjecting = false;
    self.completed = false;
    self.payload_len = 0;
    self.timeout_at = now + self.server_request_timeout_ms;
    self.last_peer_id = request.msg_id();

    self.base = MsgMeta { operation: Operation::Response,
                          code: response_code,
                          token: request.token,
                          msg_id: request.msg_id().unwrap_or(Id(0)),
                          msg_type: Type::Ack,
                          ..MsgMeta::default() };

    if response_code.is_error() {
      self.state = State::MsgToSend;
      return;
    }

    let incoming_block = request.block
                                .filter(|b| b.kind == BlockKind::B1 && !request.payload.is_empty()
                                            || b.kind == BlockKind::B1 && b.more);

    if let Some(b1) = incoming_block {
      self.block_size = self.negotiated_size(payload_buf.len()).min(b1.size);
      self.block_number = b1.number;

      if let Err(code) = handlers.write_payload(request.payload, !b1.more) {
        self.base.code = code;
        self.state = State::MsgToSend;
        return;
      }

      if b1.more {
        self.block_transfer = true;
        self.base.code = Code::CONTINUE;
        self.base.block = Some(Block::new(BlockKind::B1, b1.number, self.block_size, true));
        self.state = State::MsgToSend;
        return;
      }
    } else if !request.payload.is_empty() {
      if let Err(code) = handlers.write_payload(request.payload, true) {
        self.base.code = code;
        self.state = State::MsgToSend;
        return;
      }
    }

    // incoming body complete; produce the response body
    self.read_response_chunk(handlers, payload_buf, incoming_block.is_some());
    self.state = State::MsgToSend;
  }

  fn read_response_chunk(&mut self,
                         handlers: &mut dyn Handlers,
                         payload_buf: &mut [u8],
                         closes_block1: bool) {
    let cap = self.block_size as usize;
    let chunk_len = cap.min(payload_buf.len());
    let chunk = &mut payload_buf[..chunk_len];

    match handlers.read_payload(chunk) {
      | Ok(ReadOut::Done { len, format, created }) => {
        self.payload_len = len;
        self.base.content_format = format;
        self.base.created = created;
        if self.block_transfer && self.base.block.map(|b| b.kind) != Some(BlockKind::B1) {
          // final chunk of a Block2 stream
          self.base.block =
            Some(Block::new(BlockKind::B2, self.block_number, self.block_size, false));
        }
      },
      | Ok(ReadOut::Again { len, format }) => {
        self.payload_len = len;
        self.base.content_format = format;
        if self.block_size as usize > len {
          self.block_size = self.negotiated_size(len);
        }
        let kind = if closes_block1 {
          // the request body arrived via Block1 and the response also
          // outgrew the buffer
          BlockKind::Both
        } else {
          BlockKind::B2
        };
        let number = match kind {
          | BlockKind::Both => self.block_number,
          | _ => {
            if !self.block_transfer {
              self.block_number = 0;
            }
            self.block_number
          },
        };
        self.block_transfer = true;
        self.base.block = Some(Block::new(kind, number, self.block_size, true));
        if kind == BlockKind::Both {
          // continuation tracking now follows the Block2 stream, whose
          // first chunk just went out as number 0
          self.block_number = 0;
        }
      },
      | Err(code) => {
        self.payload_len = 0;
        self.base.code = code;
        self.base.block = None;
        self.block_transfer = false;
      },
    }
  }

  /// Step the state machine. Call with [`Event::None`] on every tick to
  /// run timers.
  pub fn process(&mut self,
                 event: Event<'_, '_>,
                 handlers: &mut dyn Handlers,
                 payload_buf: &mut [u8],
                 now: u64)
                 -> State {
    match event {
      | Event::Cancel => {
        if self.state != State::Finished {
          self.state = State::Finished;
          self.complete(handlers, None, Err(Error::Terminated));
        }
      },
      | Event::SendConfirmation if self.state == State::MsgToSend
                                   || self.state == State::WaitingSendConfirm => {
        self.on_sent(handlers, now);
      },
      | Event::SendConfirmation => {},
      | Event::NewMsg(msg) => self.on_msg(msg, handlers, payload_buf, now),
      | Event::None => self.on_tick(handlers, now),
    }

    self.state
  }

  /// The owner failed to transmit (network error): the exchange cannot
  /// make progress.
  pub fn send_failed(&mut self, handlers: &mut dyn Handlers) {
    if self.state != State::Finished {
      self.state = State::Finished;
      self.complete(handlers, None, Err(Error::Network));
    }
  }

  fn on_sent(&mut self, handlers: &mut dyn Handlers, now: u64) {
    if self.interjecting {
      self.interject = None;
      self.interjecting = false;
      // resume whatever we were doing; a pending-final interjection ends
      // the exchange instead
      if self.completed {
        self.state = State::Finished;
      } else {
        self.state = State::WaitingMsg;
      }
      return;
    }

    match self.role {
      | Role::Client => {
        if !self.confirmable {
          self.state = State::Finished;
          self.complete(handlers, None, Ok(()));
          return;
        }
        self.timeout_at = now + self.attempt_timeout_ms();
        self.state = State::WaitingMsg;
      },
      | Role::Server => {
        if self.block_transfer {
          self.timeout_at = now + self.server_request_timeout_ms;
          self.state = State::WaitingMsg;
        } else {
          self.state = State::Finished;
          let result = if self.base.code.is_error() {
            Err(Error::Coap(self.base.code))
          } else {
            Ok(())
          };
          self.complete(handlers, None, result);
        }
      },
    }
  }

  fn on_tick(&mut self, handlers: &mut dyn Handlers, now: u64) {
    if self.state != State::WaitingMsg || now < self.timeout_at {
      return;
    }

    match self.role {
      | Role::Client if !self.separate_response => {
        self.retry_count += 1;
        if self.retry_count > self.tx.max_retransmit {
          log::warn!("exchange: no response after {} attempts", self.retry_count);
          self.state = State::Finished;
          self.complete(handlers, None, Err(Error::Timeout));
          return;
        }
        log::debug!("exchange: retransmit #{}", self.retry_count);
        // identical datagram, identical id
        self.state = State::MsgToSend;
      },
      | _ => {
        self.state = State::Finished;
        self.complete(handlers, None, Err(Error::Timeout));
      },
    }
  }

  fn interject_meta(&mut self, meta: MsgMeta) {
    self.interject = Some(meta);
    self.interjecting = true;
    self.state = State::MsgToSend;
  }

  fn ack_meta(id: Id, token: Token, code: Code) -> MsgMeta {
    MsgMeta { operation: if code == Code::EMPTY {
                Operation::CoapEmptyMsg
              } else {
                Operation::Response
              },
              code,
              token,
              msg_id: id,
              msg_type: Type::Ack,
              ..MsgMeta::default() }
  }

  fn on_msg(&mut self,
            msg: &Message<'_>,
            handlers: &mut dyn Handlers,
            payload_buf: &mut [u8],
            now: u64) {
    if self.state != State::WaitingMsg {
      return;
    }

    match self.role {
      | Role::Client => self.on_client_msg(msg, handlers, payload_buf, now),
      | Role::Server => self.on_server_msg(msg, handlers, payload_buf, now),
    }
  }

  fn on_client_msg(&mut self,
                   msg: &Message<'_>,
                   handlers: &mut dyn Handlers,
                   payload_buf: &mut [u8],
                   now: u64) {
    // Reset aborts: a peer rejecting our CON (notifies use this to
    // cancel observations)
    if msg.operation == Operation::CoapReset {
      if msg.msg_id() == Some(self.base.msg_id) {
        self.state = State::Finished;
        self.complete(handlers, None, Err(Error::Reset));
      }
      return;
    }

    // empty ACK: done for notifies, separate-response notice otherwise
    if msg.operation == Operation::CoapEmptyMsg {
      if msg.msg_id() != Some(self.base.msg_id) {
        return;
      }
      if self.op.is_notify() {
        self.state = State::Finished;
        self.complete(handlers, None, Ok(()));
      } else {
        self.separate_response = true;
        self.request_prepared = true;
        self.timeout_at = now + self.server_request_timeout_ms;
      }
      return;
    }

    // a server request barging in while we wait gets 5.03 (unless it is
    // our separate response, which arrives as a CON request-shaped msg)
    if msg.token != self.base.token {
      if msg.code.kind() == newt_msg::code::CodeKind::Request {
        if let Some(id) = msg.msg_id() {
          self.interject_meta(Self::ack_meta(id, msg.token, Code::SERVICE_UNAVAILABLE));
        }
      }
      return;
    }

    // matching response
    let needs_ack = msg.msg_type() == Some(Type::Con);

    if msg.code.is_error() {
      self.finish_client(handlers, None, Err(Error::Coap(msg.code)), needs_ack, msg);
      return;
    }

    match msg.block {
      | Some(b) if b.kind == BlockKind::B1 && msg.code == Code::CONTINUE => {
        // our upload continues; honor a peer-shrunk size
        if b.size > self.block_size {
          self.finish_client(handlers, None, Err(Error::Codec), needs_ack, msg);
          return;
        }
        self.block_size = b.size;
        self.block_number += 1;

        let cap = (self.block_size as usize).min(payload_buf.len());
        match handlers.read_payload(&mut payload_buf[..cap]) {
          | Ok(ReadOut::Done { len, format, .. }) => {
            self.payload_len = len;
            self.base.content_format = format.or(self.base.content_format);
            self.base.block =
              Some(Block::new(BlockKind::B1, self.block_number, self.block_size, false));
          },
          | Ok(ReadOut::Again { len, format }) => {
            self.payload_len = len;
            self.base.content_format = format.or(self.base.content_format);
            self.base.block =
              Some(Block::new(BlockKind::B1, self.block_number, self.block_size, true));
          },
          | Err(code) => {
            self.finish_client(handlers, None, Err(Error::Coap(code)), needs_ack, msg);
            return;
          },
        }
        self.base.msg_id = self.fresh_id();
        self.retry_count = 0;
        self.initial_timeout_ms = 0;
        self.state = State::MsgToSend;
      },
      | Some(b) if b.kind == BlockKind::B2 && b.more => {
        // peer streams the response body to us
        if self.block_transfer && b.size > self.block_size {
          self.finish_client(handlers, None, Err(Error::Codec), needs_ack, msg);
          return;
        }
        if let Err(code) = handlers.write_payload(msg.payload, false) {
          self.finish_client(handlers, None, Err(Error::Coap(code)), needs_ack, msg);
          return;
        }
        self.block_transfer = true;
        self.block_size = b.size;
        self.block_number = b.number + 1;
        self.payload_len = 0;
        self.base.block = Some(Block::new(BlockKind::B2, self.block_number, b.size, false));
        self.base.msg_id = self.fresh_id();
        self.retry_count = 0;
        self.initial_timeout_ms = 0;
        self.state = State::MsgToSend;
      },
      | _ => {
        // final response
        let mut result = Ok(());
        if !msg.payload.is_empty() {
          if let Err(code) = handlers.write_payload(msg.payload, true) {
            result = Err(Error::Coap(code));
          }
        }
        self.finish_client(handlers, Some(msg), result, needs_ack, msg);
      },
    }
  }

  fn finish_client(&mut self,
                   handlers: &mut dyn Handlers,
                   response: Option<&Message<'_>>,
                   result: Result<(), Error>,
                   needs_ack: bool,
                   msg: &Message<'_>) {
    self.complete(handlers, response, result);
    if needs_ack {
      // separate response arrived as CON: acknowledge, then finish
      if let Some(id) = msg.msg_id() {
        self.interject_meta(Self::ack_meta(id, Token::default(), Code::EMPTY));
        return;
      }
    }
    self.state = State::Finished;
  }

  fn on_server_msg(&mut self,
                   msg: &Message<'_>,
                   handlers: &mut dyn Handlers,
                   payload_buf: &mut [u8],
                   now: u64) {
    let _ = now;

    // peer retransmission of the message we already answered: replay the
    // cached response, no handler calls
    if msg.msg_id().is_some() && msg.msg_id() == self.last_peer_id {
      self.state = State::MsgToSend;
      return;
    }

    // an unrelated request during our block transfer: 5.03, keep waiting
    if msg.token != self.base.token {
      if msg.code.kind() == newt_msg::code::CodeKind::Request {
        if let Some(id) = msg.msg_id() {
          self.interject_meta(Self::ack_meta(id, msg.token, Code::SERVICE_UNAVAILABLE));
        }
      }
      return;
    }

    self.last_peer_id = msg.msg_id();
    self.base.msg_id = msg.msg_id().unwrap_or(self.base.msg_id);

    match msg.block {
      | Some(b) if b.kind == BlockKind::B1 => {
        // next chunk of the peer's upload
        if b.number != self.block_number + 1 {
          // out-of-order or stale: replay the last ACK, do not touch the
          // handlers
          self.state = State::MsgToSend;
          return;
        }
        if b.size > self.block_size {
          self.base.code = Code::REQUEST_ENTITY_INCOMPLETE;
          self.base.block = None;
          self.block_transfer = false;
          self.state = State::MsgToSend;
          return;
        }

        self.block_size = b.size;
        self.block_number = b.number;

        if let Err(code) = handlers.write_payload(msg.payload, !b.more) {
          self.base.code = code;
          self.base.block = None;
          self.block_transfer = false;
          self.state = State::MsgToSend;
          return;
        }

        if b.more {
          self.base.code = Code::CONTINUE;
          self.base.block = Some(Block::new(BlockKind::B1, b.number, self.block_size, true));
        } else {
          // upload done; the stored success code takes over
          self.block_transfer = false;
          self.base.code = self.success_code_for_op();
          self.base.block = Some(Block::new(BlockKind::B1, b.number, self.block_size, false));
          self.read_response_chunk(handlers, payload_buf, true);
        }
        self.state = State::MsgToSend;
      },
      | Some(b) if b.kind == BlockKind::B2 => {
        // peer asks for the next chunk of our response
        if b.number == self.block_number + 1 && self.block_transfer {
          if b.size < self.block_size {
            self.block_size = b.size;
          }
          self.block_number = b.number;
          self.base.block = None;
          self.base.code = self.success_code_for_op();
          self.read_response_chunk_numbered(handlers, payload_buf);
          self.state = State::MsgToSend;
        } else {
          // repeat of the chunk we already produced
          self.state = State::MsgToSend;
        }
      },
      | _ => {
        // same token, no block: treat as duplicate; replay
        self.state = State::MsgToSend;
      },
    }
  }

  fn read_response_chunk_numbered(&mut self, handlers: &mut dyn Handlers, payload_buf: &mut [u8]) {
    let cap = (self.block_size as usize).min(payload_buf.len());
    match handlers.read_payload(&mut payload_buf[..cap]) {
      | Ok(ReadOut::Done { len, format, created }) => {
        self.payload_len = len;
        self.base.content_format = format;
        self.base.created = created;
        self.block_transfer = false;
        self.base.block =
          Some(Block::new(BlockKind::B2, self.block_number, self.block_size, false));
      },
      | Ok(ReadOut::Again { len, format }) => {
        self.payload_len = len;
        self.base.content_format = format;
        self.base.block =
          Some(Block::new(BlockKind::B2, self.block_number, self.block_size, true));
      },
      | Err(code) => {
        self.payload_len = 0;
        self.base.code = code;
        self.base.block = None;
        self.block_transfer = false;
      },
    }
  }

  fn success_code_for_op(&self) -> Code {
    match self.op {
      | Operation::DmRead | Operation::DmReadComp | Operation::DmDiscover => Code::CONTENT,
      | Operation::DmCreate => Code::CREATED,
      | Operation::DmDelete => Code::DELETED,
      | Operation::BootstrapFinish => Code::CHANGED,
      | Operation::InfObserve | Operation::InfObserveComp => Code::CONTENT,
      | _ => Code::CHANGED,
    }
  }
}

#[cfg(test)]
mod tests {
  use std_alloc::vec::Vec;

  use newt_msg::{Binding, UriPath};

  use super::*;

  #[derive(Default)]
  struct Script {
    chunks: Vec<Vec<u8>>,
    chunk_ix: usize,
    format: Option<ContentFormat>,
    written: Vec<(Vec<u8>, bool)>,
    completions: Vec<Result<(), Error>>,
  }

  impl Script {
    fn reading(chunks: &[&[u8]]) -> Self {
      Self { chunks: chunks.iter().map(|c| c.to_vec()).collect(),
             format: Some(ContentFormat::PLAIN_TEXT),
             ..Self::default() }
    }
  }

  impl Handlers for Script {
    fn read_payload(&mut self, buf: &mut [u8]) -> Result<ReadOut, Code> {
      if self.chunks.is_empty() {
        return Ok(ReadOut::Done { len: 0, format: None, created: None });
      }

      let chunk = &self.chunks[self.chunk_ix];
      buf[..chunk.len()].copy_from_slice(chunk);
      let last = self.chunk_ix == self.chunks.len() - 1;
      self.chunk_ix += 1;

      if last {
        Ok(ReadOut::Done { len: chunk.len(),
                           format: self.format,
                           created: None })
      } else {
        Ok(ReadOut::Again { len: chunk.len(), format: self.format })
      }
    }

    fn write_payload(&mut self, chunk: &[u8], last_block: bool) -> Result<(), Code> {
      self.written.push((chunk.to_vec(), last_block));
      Ok(())
    }

    fn completion(&mut self, _response: Option<&Message<'_>>, result: Result<(), Error>) {
      self.completions.push(result);
    }
  }

  fn request<'a>(op: Operation,
                 code: Code,
                 token: &[u8],
                 id: u16,
                 uri: UriPath,
                 payload: &'a [u8],
                 block: Option<Block>)
                 -> Message<'a> {
    Message { operation: op,
              code,
              token: Token::from_bytes(token).unwrap(),
              uri,
              content_format: (!payload.is_empty()).then_some(ContentFormat::PLAIN_TEXT),
              block,
              payload,
              binding: Binding::Udp { id: Id(id), ty: Type::Con },
              ..Message::default() }
  }

  fn exchange() -> Exchange {
    let _ = simple_logger::init_with_level(log::Level::Debug);
    Exchange::new(TxParams::default(), 10_000, 42)
  }

  #[test]
  fn single_block_server_response() {
    let mut ex = exchange();
    let mut h = Script::reading(&[b"22.5"]);
    let mut buf = [0u8; 64];

    let req = request(Operation::DmRead,
                      Code::GET,
                      &[1, 2],
                      100,
                      UriPath::resource(3303, 0, 5700),
                      &[],
                      None);
    ex.new_server_request(Code::CONTENT, &req, &mut h, &mut buf, 0);
    assert_eq!(ex.state(), State::MsgToSend);
    assert_eq!(ex.current().code, Code::CONTENT);
    assert_eq!(ex.payload_len(), 4);
    assert_eq!(&buf[..4], b"22.5");

    ex.process(Event::SendConfirmation, &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Ok(())]);
  }

  #[test]
  fn error_code_short_circuits_handlers() {
    let mut ex = exchange();
    let mut h = Script::reading(&[b"never"]);
    let mut buf = [0u8; 64];

    let req = request(Operation::DmRead,
                      Code::GET,
                      &[9],
                      7,
                      UriPath::resource(9, 9, 9),
                      &[],
                      None);
    ex.new_server_request(Code::NOT_FOUND, &req, &mut h, &mut buf, 0);
    assert_eq!(ex.current().code, Code::NOT_FOUND);
    assert_eq!(ex.payload_len(), 0);
    assert_eq!(h.chunk_ix, 0, "read_payload must not run");

    ex.process(Event::SendConfirmation, &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Err(Error::Coap(Code::NOT_FOUND))]);
  }

  #[test]
  fn block2_read_streams_three_chunks() {
    // S2: three 16-byte blocks
    let mut ex = exchange();
    let mut h = Script::reading(&[&[0xAA; 16], &[0xBB; 16], &[0xCC; 16]]);
    let mut buf = [0u8; 16];

    let req = request(Operation::DmRead,
                      Code::GET,
                      &[1],
                      1,
                      UriPath::instance(3, 0),
                      &[],
                      None);
    ex.new_server_request(Code::CONTENT, &req, &mut h, &mut buf, 0);

    let b = ex.current().block.unwrap();
    assert_eq!((b.kind, b.number, b.size, b.more),
               (BlockKind::B2, 0, 16, true));
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::WaitingMsg);

    for (req_num, expect_more) in [(1u32, true), (2, false)] {
      let cont = request(Operation::DmRead,
                         Code::GET,
                         &[1],
                         1 + req_num as u16,
                         UriPath::instance(3, 0),
                         &[],
                         Some(Block::new(BlockKind::B2, req_num, 16, false)));
      ex.process(Event::NewMsg(&cont), &mut h, &mut buf, 2);
      let b = ex.current().block.unwrap();
      assert_eq!((b.kind, b.number, b.more),
                 (BlockKind::B2, req_num, expect_more));
      ex.process(Event::SendConfirmation, &mut h, &mut buf, 3);
    }

    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Ok(())]);
  }

  #[test]
  fn block1_write_with_retransmitted_block() {
    // S3: three blocks, the first retransmitted once
    let mut ex = exchange();
    let mut h = Script::default();
    let mut buf = [0u8; 64];

    let b0 = request(Operation::DmWriteReplace,
                     Code::PUT,
                     &[5],
                     50,
                     UriPath::instance(1, 0),
                     b"1234567812345678",
                     Some(Block::new(BlockKind::B1, 0, 16, true)));
    ex.new_server_request(Code::CHANGED, &b0, &mut h, &mut buf, 0);
    assert_eq!(ex.current().code, Code::CONTINUE);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::WaitingMsg);

    // retransmission of block 0: same ACK, no new write_payload
    ex.process(Event::NewMsg(&b0), &mut h, &mut buf, 2);
    assert_eq!(ex.state(), State::MsgToSend);
    assert_eq!(ex.current().code, Code::CONTINUE);
    assert_eq!(h.written.len(), 1);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 3);

    let b1 = request(Operation::DmWriteReplace,
                     Code::PUT,
                     &[5],
                     51,
                     UriPath::instance(1, 0),
                     b"1111111122222222",
                     Some(Block::new(BlockKind::B1, 1, 16, true)));
    ex.process(Event::NewMsg(&b1), &mut h, &mut buf, 4);
    assert_eq!(ex.current().code, Code::CONTINUE);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 5);

    let b2 = request(Operation::DmWriteReplace,
                     Code::PUT,
                     &[5],
                     52,
                     UriPath::instance(1, 0),
                     b"AAAAAAAAAAAAAAAA",
                     Some(Block::new(BlockKind::B1, 2, 16, false)));
    ex.process(Event::NewMsg(&b2), &mut h, &mut buf, 6);
    assert_eq!(ex.current().code, Code::CHANGED);
    let b = ex.current().block.unwrap();
    assert_eq!((b.kind, b.number, b.more), (BlockKind::B1, 2, false));
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 7);

    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Ok(())]);
    assert_eq!(h.written,
               vec![(b"1234567812345678".to_vec(), false),
                    (b"1111111122222222".to_vec(), false),
                    (b"AAAAAAAAAAAAAAAA".to_vec(), true)]);
  }

  #[test]
  fn interloper_gets_service_unavailable() {
    // S6: while waiting for the next block, an unrelated request arrives
    let mut ex = exchange();
    let mut h = Script::reading(&[&[0x11; 16], &[0x22; 16]]);
    let mut buf = [0u8; 16];

    let req = request(Operation::DmRead,
                      Code::GET,
                      &[1],
                      1,
                      UriPath::instance(3, 0),
                      &[],
                      None);
    ex.new_server_request(Code::CONTENT, &req, &mut h, &mut buf, 0);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::WaitingMsg);

    let interloper = request(Operation::DmRead,
                             Code::GET,
                             &[0xDE, 0xAD],
                             999,
                             UriPath::object(4),
                             &[],
                             None);
    ex.process(Event::NewMsg(&interloper), &mut h, &mut buf, 2);
    assert_eq!(ex.state(), State::MsgToSend);
    assert_eq!(ex.current().code, Code::SERVICE_UNAVAILABLE);
    assert_eq!(ex.current().msg_id, Id(999));
    assert_eq!(ex.payload_len(), 0);

    ex.process(Event::SendConfirmation, &mut h, &mut buf, 3);
    assert_eq!(ex.state(), State::WaitingMsg, "original exchange continues");

    // the real continuation still works
    let cont = request(Operation::DmRead,
                       Code::GET,
                       &[1],
                       2,
                       UriPath::instance(3, 0),
                       &[],
                       Some(Block::new(BlockKind::B2, 1, 16, false)));
    ex.process(Event::NewMsg(&cont), &mut h, &mut buf, 4);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 5);
    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Ok(())]);
  }

  #[test]
  fn client_request_retransmits_then_times_out() {
    let mut ex = exchange();
    let mut h = Script::default();
    let mut buf = [0u8; 64];

    let meta = MsgMeta { operation: Operation::Register,
                         code: Code::POST,
                         token: Token::from_bytes(&[7]).unwrap(),
                         ..MsgMeta::default() };
    ex.new_client_request(meta, &mut h, &mut buf, 0);
    assert_eq!(ex.state(), State::MsgToSend);

    let mut now = 0u64;
    let mut sends = 0u32;
    // drive to exhaustion; max_retransmit = 4 means 5 transmissions
    for _ in 0..200 {
      match ex.state() {
        | State::MsgToSend => {
          sends += 1;
          ex.process(Event::SendConfirmation, &mut h, &mut buf, now);
        },
        | State::WaitingMsg => {
          now += 1000;
          ex.process(Event::None, &mut h, &mut buf, now);
        },
        | State::Finished => break,
        | State::WaitingSendConfirm => unreachable!(),
      }
    }

    assert_eq!(sends, 5);
    assert_eq!(h.completions, vec![Err(Error::Timeout)]);
    // bounded by sum of T_k with max jitter factor 1.5, plus the 1s
    // polling granularity per attempt
    assert!(now <= (2000.0 * 1.5 * 31.0) as u64 + 5000);
  }

  #[test]
  fn client_request_success_and_separate_response() {
    let mut ex = exchange();
    let mut h = Script::default();
    let mut buf = [0u8; 64];

    let meta = MsgMeta { operation: Operation::Register,
                         code: Code::POST,
                         token: Token::from_bytes(&[0xAB]).unwrap(),
                         ..MsgMeta::default() };
    ex.new_client_request(meta, &mut h, &mut buf, 0);
    let sent_id = ex.current().msg_id;
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 0);

    // empty ACK: the response will come separately
    let ack = Message { operation: Operation::CoapEmptyMsg,
                        code: Code::EMPTY,
                        binding: Binding::Udp { id: sent_id, ty: Type::Ack },
                        ..Message::default() };
    ex.process(Event::NewMsg(&ack), &mut h, &mut buf, 10);
    assert!(ex.separate_response());
    assert_eq!(ex.state(), State::WaitingMsg);
    assert!(h.completions.is_empty());

    // the real response arrives as a CON with our token
    let resp = Message { operation: Operation::Response,
                         code: Code::CREATED,
                         token: Token::from_bytes(&[0xAB]).unwrap(),
                         binding: Binding::Udp { id: Id(0x7777), ty: Type::Con },
                         ..Message::default() };
    ex.process(Event::NewMsg(&resp), &mut h, &mut buf, 20);
    assert_eq!(h.completions, vec![Ok(())]);

    // and we owe it an empty ACK
    assert_eq!(ex.state(), State::MsgToSend);
    assert_eq!(ex.current().code, Code::EMPTY);
    assert_eq!(ex.current().msg_id, Id(0x7777));
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 21);
    assert_eq!(ex.state(), State::Finished);
  }

  #[test]
  fn error_response_completes_with_code() {
    let mut ex = exchange();
    let mut h = Script::default();
    let mut buf = [0u8; 64];

    let meta = MsgMeta { operation: Operation::Register,
                         code: Code::POST,
                         token: Token::from_bytes(&[1]).unwrap(),
                         ..MsgMeta::default() };
    ex.new_client_request(meta, &mut h, &mut buf, 0);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 0);

    let resp = Message { operation: Operation::Response,
                         code: Code::FORBIDDEN,
                         token: Token::from_bytes(&[1]).unwrap(),
                         binding: Binding::Udp { id: ex.current().msg_id, ty: Type::Ack },
                         ..Message::default() };
    ex.process(Event::NewMsg(&resp), &mut h, &mut buf, 5);
    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Err(Error::Coap(Code::FORBIDDEN))]);
  }

  #[test]
  fn cancel_fires_completion_once() {
    let mut ex = exchange();
    let mut h = Script::default();
    let mut buf = [0u8; 64];

    let meta = MsgMeta { operation: Operation::Update,
                         code: Code::POST,
                         token: Token::from_bytes(&[2]).unwrap(),
                         ..MsgMeta::default() };
    ex.new_client_request(meta, &mut h, &mut buf, 0);
    ex.process(Event::Cancel, &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::Finished);
    ex.process(Event::Cancel, &mut h, &mut buf, 2);
    assert_eq!(h.completions, vec![Err(Error::Terminated)]);
  }

  #[test]
  fn non_confirmable_send_completes_on_send() {
    let mut ex = exchange();
    let mut h = Script::reading(&[b"data"]);
    let mut buf = [0u8; 64];

    let meta = MsgMeta { operation: Operation::InfNonConSend,
                         code: Code::POST,
                         token: Token::from_bytes(&[3]).unwrap(),
                         ..MsgMeta::default() };
    ex.new_client_request(meta, &mut h, &mut buf, 0);
    assert_eq!(ex.current().msg_type, Type::Non);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Ok(())]);
  }

  #[test]
  fn con_notify_reset_reports_reset() {
    let mut ex = exchange();
    let mut h = Script::reading(&[b"21"]);
    let mut buf = [0u8; 64];

    let meta = MsgMeta { operation: Operation::InfConNotify,
                         code: Code::CONTENT,
                         token: Token::from_bytes(&[4]).unwrap(),
                         observe: Some(3),
                         ..MsgMeta::default() };
    ex.new_client_request(meta, &mut h, &mut buf, 0);
    let id = ex.current().msg_id;
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 0);

    let rst = Message { operation: Operation::CoapReset,
                        code: Code::EMPTY,
                        binding: Binding::Udp { id, ty: Type::Reset },
                        ..Message::default() };
    ex.process(Event::NewMsg(&rst), &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Err(Error::Reset)]);
  }

  #[test]
  fn server_request_inactivity_timeout() {
    let mut ex = exchange();
    let mut h = Script::default();
    let mut buf = [0u8; 16];

    let b0 = request(Operation::DmWriteReplace,
                     Code::PUT,
                     &[5],
                     50,
                     UriPath::instance(1, 0),
                     b"0123456789ABCDEF",
                     Some(Block::new(BlockKind::B1, 0, 16, true)));
    ex.new_server_request(Code::CHANGED, &b0, &mut h, &mut buf, 0);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 1);
    assert_eq!(ex.state(), State::WaitingMsg);

    ex.process(Event::None, &mut h, &mut buf, 5_000);
    assert_eq!(ex.state(), State::WaitingMsg);
    ex.process(Event::None, &mut h, &mut buf, 20_000);
    assert_eq!(ex.state(), State::Finished);
    assert_eq!(h.completions, vec![Err(Error::Timeout)]);
  }

  #[test]
  fn peer_cannot_grow_negotiated_block_size() {
    let mut ex = exchange();
    let mut h = Script::default();
    let mut buf = [0u8; 16];

    let b0 = request(Operation::DmWriteReplace,
                     Code::PUT,
                     &[5],
                     50,
                     UriPath::instance(1, 0),
                     b"0123456789ABCDEF",
                     Some(Block::new(BlockKind::B1, 0, 16, true)));
    ex.new_server_request(Code::CHANGED, &b0, &mut h, &mut buf, 0);
    ex.process(Event::SendConfirmation, &mut h, &mut buf, 1);

    let grown = request(Operation::DmWriteReplace,
                        Code::PUT,
                        &[5],
                        51,
                        UriPath::instance(1, 0),
                        &[0u8; 32],
                        Some(Block::new(BlockKind::B1, 1, 32, true)));
    ex.process(Event::NewMsg(&grown), &mut h, &mut buf, 2);
    assert_eq!(ex.current().code, Code::REQUEST_ENTITY_INCOMPLETE);
    assert_eq!(h.written.len(), 1, "grown block not fed to handlers");
  }
}
