//! Mirrors of the Security (0) and Server (1) object instances the
//! session talks through. Refreshed from the data model when a
//! connection cycle starts, so user- or bootstrap-written values take
//! effect on the next registration.

use newt_msg::UriPath;
use std_alloc::string::String;

use crate::dm::{oid, security_rid, server_rid, Registry, Value};
use crate::error::Error;
use crate::observe::ServerState;

/// Communication-retry resources of the Server object, with the
/// LwM2M-defined defaults.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryRes {
  /// `/1/x/17` attempts per sequence
  pub retry_count: u16,
  /// `/1/x/18` base delay, seconds (doubled per attempt)
  pub retry_timer: u32,
  /// `/1/x/19` delay between sequences, seconds
  pub seq_delay_timer: u32,
  /// `/1/x/20` number of sequences
  pub seq_retry_count: u16,
}

impl Default for RetryRes {
  fn default() -> Self {
    Self { retry_count: 5,
           retry_timer: 60,
           seq_delay_timer: 24 * 60 * 60,
           seq_retry_count: 1 }
  }
}

/// Mirror of the chosen Security instance.
#[derive(Clone, Debug, Default)]
pub struct SecurityMirror {
  /// Instance id
  pub iid: u16,
  /// Full `coap(s)://` URI
  pub uri: String,
  /// Host part of the URI
  pub host: String,
  /// Port (defaulted from the scheme when absent)
  pub port: u16,
  /// Whether this instance addresses the Bootstrap-Server
  pub bootstrap: bool,
  /// `/0/x/11` hold-off before client-initiated bootstrap, seconds
  pub hold_off_s: u32,
}

/// Mirror of the chosen Server instance.
#[derive(Clone, Debug)]
pub struct ServerMirror {
  /// Short server id
  pub ssid: u16,
  /// Instance id
  pub iid: u16,
  /// `/1/x/1` registration lifetime, seconds
  pub lifetime_s: u32,
  /// Communication-retry resources
  pub retry: RetryRes,
  /// `/1/x/16`
  pub bootstrap_on_failure: bool,
  /// `/1/x/23`
  pub mute_send: bool,
  /// Notification scheduling inputs for the observe engine
  pub observe_state: ServerState,
}

impl Default for ServerMirror {
  fn default() -> Self {
    Self { ssid: 0,
           iid: 0,
           lifetime_s: 86400,
           retry: RetryRes::default(),
           bootstrap_on_failure: true,
           mute_send: false,
           observe_state: ServerState::default() }
  }
}

fn read_u32(reg: &mut Registry, path: UriPath) -> Option<u32> {
  reg.res_read(&path).ok().and_then(|v| v.as_u32())
}

fn read_u16(reg: &mut Registry, path: UriPath) -> Option<u16> {
  reg.res_read(&path).ok().and_then(|v| v.as_u16())
}

fn read_bool(reg: &mut Registry, path: UriPath) -> Option<bool> {
  reg.res_read(&path).ok().and_then(|v| v.as_bool())
}

fn read_string(reg: &mut Registry, path: UriPath) -> Option<String> {
  match reg.res_read(&path) {
    | Ok(Value::Str(c)) => core::str::from_utf8(c.data).ok().map(String::from),
    | _ => None,
  }
}

/// Split `coap://host:port` / `coaps://host` into host and port,
/// defaulting the port from the scheme.
pub(crate) fn parse_server_uri(uri: &str) -> Result<(String, u16), Error> {
  let (secure, rest) = if let Some(rest) = uri.strip_prefix("coaps+tcp://") {
    (true, rest)
  } else if let Some(rest) = uri.strip_prefix("coap+tcp://") {
    (false, rest)
  } else if let Some(rest) = uri.strip_prefix("coaps://") {
    (true, rest)
  } else if let Some(rest) = uri.strip_prefix("coap://") {
    (false, rest)
  } else {
    return Err(Error::InvalidConfig);
  };

  let rest = rest.split('/').next().unwrap_or(rest);
  if rest.is_empty() {
    return Err(Error::InvalidConfig);
  }

  match rest.rsplit_once(':') {
    | Some((host, port)) if !host.contains(']') || host.ends_with(']') => {
      let port = port.parse::<u16>().map_err(|_| Error::InvalidConfig)?;
      Ok((String::from(host), port))
    },
    | _ => Ok((String::from(rest), if secure { 5684 } else { 5683 })),
  }
}

/// Read the Security instance at `iid` out of the data model.
pub(crate) fn security_mirror(reg: &mut Registry,
                              iid: u16,
                              bootstrap: bool)
                              -> Result<SecurityMirror, Error> {
  let uri = read_string(reg,
                        UriPath::resource(oid::SECURITY, iid, security_rid::SERVER_URI))
              .ok_or(Error::InvalidConfig)?;
  let (host, port) = parse_server_uri(&uri)?;

  Ok(SecurityMirror { iid,
                      uri,
                      host,
                      port,
                      bootstrap,
                      hold_off_s:
                        read_u32(reg,
                                 UriPath::resource(oid::SECURITY,
                                                   iid,
                                                   security_rid::CLIENT_HOLD_OFF)).unwrap_or(0) })
}

/// Read the Server instance whose `/1/x/0` equals `ssid`.
pub(crate) fn server_mirror(reg: &mut Registry, ssid: u16) -> Result<ServerMirror, Error> {
  let iids: std_alloc::vec::Vec<u16> =
    reg.entry(oid::SERVER)
       .map(|e| e.def.insts.iter().map(|i| i.iid).collect())
       .unwrap_or_default();

  for iid in iids {
    if read_u16(reg, UriPath::resource(oid::SERVER, iid, server_rid::SSID)) != Some(ssid) {
      continue;
    }

    let retry = RetryRes {
      retry_count:
        read_u16(reg, UriPath::resource(oid::SERVER, iid, server_rid::RETRY_COUNT))
          .unwrap_or(RetryRes::default().retry_count),
      retry_timer:
        read_u32(reg, UriPath::resource(oid::SERVER, iid, server_rid::RETRY_TIMER))
          .unwrap_or(RetryRes::default().retry_timer),
      seq_delay_timer:
        read_u32(reg, UriPath::resource(oid::SERVER, iid, server_rid::SEQ_DELAY_TIMER))
          .unwrap_or(RetryRes::default().seq_delay_timer),
      seq_retry_count:
        read_u16(reg, UriPath::resource(oid::SERVER, iid, server_rid::SEQ_RETRY_COUNT))
          .unwrap_or(RetryRes::default().seq_retry_count),
    };

    let observe_state = ServerState {
      ssid,
      online: false,
      default_pmin:
        read_u32(reg, UriPath::resource(oid::SERVER, iid, server_rid::DEFAULT_PMIN))
          .unwrap_or(0),
      default_pmax:
        read_u32(reg, UriPath::resource(oid::SERVER, iid, server_rid::DEFAULT_PMAX))
          .unwrap_or(0),
      notify_store:
        read_bool(reg, UriPath::resource(oid::SERVER, iid, server_rid::NOTIFY_STORING))
          .unwrap_or(false),
      default_con:
        read_u32(reg, UriPath::resource(oid::SERVER, iid, server_rid::DEFAULT_CON))
          .unwrap_or(0),
    };

    return Ok(ServerMirror {
      ssid,
      iid,
      lifetime_s: read_u32(reg, UriPath::resource(oid::SERVER, iid, server_rid::LIFETIME))
                    .unwrap_or(86400),
      retry,
      bootstrap_on_failure:
        read_bool(reg,
                  UriPath::resource(oid::SERVER, iid, server_rid::BOOTSTRAP_ON_FAILURE))
          .unwrap_or(true),
      mute_send: read_bool(reg, UriPath::resource(oid::SERVER, iid, server_rid::MUTE_SEND))
                   .unwrap_or(false),
      observe_state,
    });
  }

  Err(Error::InvalidConfig)
}

/// Pick the connection targets: the regular Security+Server pair when
/// one exists, otherwise the Bootstrap-Server Security instance.
pub(crate) fn pick_targets(reg: &mut Registry)
                           -> Result<(SecurityMirror, Option<ServerMirror>), Error> {
  let instances = reg.security_instances();

  for (iid, is_bs) in instances.iter().copied() {
    if is_bs {
      continue;
    }
    let ssid = match read_u16(reg, UriPath::resource(oid::SECURITY, iid, security_rid::SSID)) {
      | Some(ssid) => ssid,
      | None => continue,
    };
    if let Ok(server) = server_mirror(reg, ssid) {
      let security = security_mirror(reg, iid, false)?;
      return Ok((security, Some(server)));
    }
  }

  for (iid, is_bs) in instances {
    if is_bs {
      let security = security_mirror(reg, iid, true)?;
      return Ok((security, None));
    }
  }

  Err(Error::InvalidConfig)
}
