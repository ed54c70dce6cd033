use std_alloc::string::String;

/// CoAP transmission parameters for confirmable client requests
/// (RFC 7252 §4.8).
///
/// The first attempt's timeout is a random duration in
/// `[ack_timeout_ms, ack_timeout_ms · ack_random_factor]`; every
/// retransmission doubles it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxParams {
  /// RFC 7252 `ACK_TIMEOUT`.
  ///
  /// ```
  /// use newt::config::TxParams;
  ///
  /// assert_eq!(TxParams::default().ack_timeout_ms, 2000);
  /// ```
  pub ack_timeout_ms: u64,

  /// RFC 7252 `ACK_RANDOM_FACTOR`.
  ///
  /// ```
  /// use newt::config::TxParams;
  ///
  /// assert_eq!(TxParams::default().ack_random_factor, 1.5);
  /// ```
  pub ack_random_factor: f64,

  /// RFC 7252 `MAX_RETRANSMIT`.
  ///
  /// ```
  /// use newt::config::TxParams;
  ///
  /// assert_eq!(TxParams::default().max_retransmit, 4);
  /// ```
  pub max_retransmit: u16,
}

impl Default for TxParams {
  fn default() -> Self {
    Self { ack_timeout_ms: 2000,
           ack_random_factor: 1.5,
           max_retransmit: 4 }
  }
}

impl TxParams {
  /// RFC 7252 `MAX_TRANSMIT_WAIT` for these parameters: the longest a
  /// sender waits, in total, for an acknowledgement.
  pub fn max_transmit_wait_ms(&self) -> u64 {
    let doublings = (1u64 << (self.max_retransmit as u32 + 1)) - 1;
    (self.ack_timeout_ms as f64 * doublings as f64 * self.ack_random_factor) as u64
  }
}

/// Session configuration, provided once to [`crate::session::Session::new`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
  /// Endpoint client name presented to LwM2M servers. Must be non-empty.
  pub endpoint: String,

  /// Enables LwM2M Queue Mode: after [`Config::queue_mode_timeout_ms`] of
  /// no exchange activity the transport is closed and the client sleeps
  /// until the next scheduled update / notify / send.
  pub queue_mode_enabled: bool,

  /// Inactivity window before entering queue mode. `None` derives the
  /// default from `MAX_TRANSMIT_WAIT`.
  ///
  /// ```
  /// use newt::config::Config;
  ///
  /// let cfg = Config::new("ep");
  /// // 2000ms · (2^5 - 1) · 1.5
  /// assert_eq!(cfg.queue_mode_timeout_ms(), 93_000);
  /// ```
  pub queue_mode_timeout_override_ms: Option<u64>,

  /// How long to wait for the next block of an LwM2M Server request
  /// before abandoning the server-initiated exchange.
  ///
  /// ```
  /// use newt::config::Config;
  ///
  /// assert_eq!(Config::new("ep").server_request_timeout_ms, 40_000);
  /// ```
  pub server_request_timeout_ms: u64,

  /// UDP transmission parameters for client requests.
  pub tx_params: TxParams,

  /// Successive bootstrap attempts before the sequence counts as failed.
  ///
  /// ```
  /// use newt::config::Config;
  ///
  /// assert_eq!(Config::new("ep").bootstrap_retry_count, 5);
  /// ```
  pub bootstrap_retry_count: u16,

  /// Base delay between bootstrap attempts, in seconds; attempt `n`
  /// waits `bootstrap_retry_timeout_s · 2^(n-1)`.
  pub bootstrap_retry_timeout_s: u32,

  /// Maximum inactivity during the bootstrap phase. Defaults to the CoAP
  /// `EXCHANGE_LIFETIME` of 247 seconds.
  ///
  /// ```
  /// use newt::config::Config;
  ///
  /// assert_eq!(Config::new("ep").bootstrap_timeout_s, 247);
  /// ```
  pub bootstrap_timeout_s: u32,

  /// Size of the in/out message buffers. Bounds the largest datagram the
  /// session can receive or send.
  pub msg_buffer_size: usize,

  /// Size of the outgoing-payload scratch buffer; also the upper bound
  /// on the negotiated block size.
  pub payload_buffer_size: usize,
}

impl Config {
  /// A configuration with the given endpoint name and defaults for
  /// everything else.
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self { endpoint: endpoint.into(),
           queue_mode_enabled: false,
           queue_mode_timeout_override_ms: None,
           server_request_timeout_ms: 40_000,
           tx_params: TxParams::default(),
           bootstrap_retry_count: 5,
           bootstrap_retry_timeout_s: 3,
           bootstrap_timeout_s: 247,
           msg_buffer_size: 1280,
           payload_buffer_size: 1024 }
  }

  /// The effective queue-mode inactivity window.
  pub fn queue_mode_timeout_ms(&self) -> u64 {
    self.queue_mode_timeout_override_ms
        .unwrap_or_else(|| self.tx_params.max_transmit_wait_ms())
  }

  /// Whether the configuration is complete enough to start.
  pub fn valid(&self) -> bool {
    !self.endpoint.is_empty()
    && self.msg_buffer_size >= 128
    && self.payload_buffer_size >= 16
    && self.tx_params.max_retransmit > 0
    && self.tx_params.ack_random_factor >= 1.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn max_transmit_wait() {
    // 2000 · 31 · 1.5
    assert_eq!(TxParams::default().max_transmit_wait_ms(), 93_000);
  }

  #[test]
  fn validity() {
    assert!(Config::new("urn:dev:os:123").valid());
    assert!(!Config::new("").valid());

    let mut cfg = Config::new("ep");
    cfg.tx_params.ack_random_factor = 0.5;
    assert!(!cfg.valid());
  }
}
