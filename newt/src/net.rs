/// Lifecycle state of a transport context.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransportState {
  /// No socket resources held
  Closed,
  /// Half-closed: peer notified, resources not yet released
  Shutdown,
  /// Bound to a local port, not connected
  Bound,
  /// Connected and able to send / receive
  Connected,
}

/// Unrecoverable transport error kinds the runtime distinguishes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransportError {
  /// An inbound datagram did not fit the provided buffer
  MsgSize,
  /// Anything else: reset, unreachable, closed underneath us
  Io,
}

/// The byte-level I/O contract the session drives (UDP, TCP, or either
/// under (D)TLS — the security layer is the implementor's business).
///
/// All calls are non-blocking in the [`nb`] sense: an operation that
/// cannot complete yet returns [`nb::Error::WouldBlock`] and the session
/// retries it on a later tick. Connecting is expected to modify the
/// context in place rather than yield a new connected type.
///
/// For datagram transports, `send` is all-or-nothing: a partial UDP send
/// is an error, never a short count.
pub trait Transport {
  /// Open the transport towards `host:port`. May complete over several
  /// calls; keep calling while it returns `WouldBlock`.
  fn connect(&mut self, host: &str, port: u16) -> nb::Result<(), TransportError>;

  /// Send `buf`. Returns the number of bytes accepted, which for
  /// datagram transports is always `buf.len()`.
  fn send(&mut self, buf: &[u8]) -> nb::Result<usize, TransportError>;

  /// Receive into `buf`, returning the number of bytes read.
  /// `WouldBlock` when nothing is pending.
  fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError>;

  /// Begin an orderly teardown. Like `connect`, may need repeating.
  fn shutdown(&mut self) -> nb::Result<(), TransportError>;

  /// Release all resources immediately.
  fn close(&mut self);

  /// Largest payload that fits one datagram / segment after transport
  /// and security overhead.
  fn inner_mtu(&self) -> i32;

  /// Current lifecycle state.
  fn state(&self) -> TransportState;

  /// Re-bind to the local port used by the previous connection, so a
  /// NAT'd server still reaches us after queue mode.
  fn reuse_last_port(&mut self) -> nb::Result<(), TransportError>;
}

#[cfg(test)]
pub(crate) mod test {
  use std_alloc::collections::VecDeque;
  use std_alloc::vec::Vec;

  use super::*;

  /// Scripted in-memory transport: tests push inbound datagrams and
  /// inspect what the session sent.
  #[derive(Debug, Default)]
  pub(crate) struct MockTransport {
    pub(crate) connected: bool,
    pub(crate) sent: Vec<Vec<u8>>,
    pub(crate) inbound: VecDeque<Vec<u8>>,
    pub(crate) fail_sends: usize,
  }

  impl MockTransport {
    pub(crate) fn new() -> Self {
      Self::default()
    }

    pub(crate) fn push_inbound(&mut self, dgram: &[u8]) {
      self.inbound.push_back(dgram.to_vec());
    }

    pub(crate) fn last_sent(&self) -> Option<&[u8]> {
      self.sent.last().map(|v| v.as_slice())
    }
  }

  impl Transport for MockTransport {
    fn connect(&mut self, _host: &str, _port: u16) -> nb::Result<(), TransportError> {
      self.connected = true;
      Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> nb::Result<usize, TransportError> {
      if self.fail_sends > 0 {
        self.fail_sends -= 1;
        return Err(nb::Error::Other(TransportError::Io));
      }
      self.sent.push(buf.to_vec());
      Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
      match self.inbound.pop_front() {
        | None => Err(nb::Error::WouldBlock),
        | Some(dgram) if dgram.len() > buf.len() => {
          Err(nb::Error::Other(TransportError::MsgSize))
        },
        | Some(dgram) => {
          buf[..dgram.len()].copy_from_slice(&dgram);
          Ok(dgram.len())
        },
      }
    }

    fn shutdown(&mut self) -> nb::Result<(), TransportError> {
      Ok(())
    }

    fn close(&mut self) {
      self.connected = false;
    }

    fn inner_mtu(&self) -> i32 {
      1152
    }

    fn state(&self) -> TransportState {
      if self.connected {
        TransportState::Connected
      } else {
        TransportState::Closed
      }
    }

    fn reuse_last_port(&mut self) -> nb::Result<(), TransportError> {
      Ok(())
    }
  }
}
