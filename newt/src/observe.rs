//! Observations, write-attributes storage, and notification scheduling.
//!
//! Attribute resolution walks the path chain — server defaults, object,
//! instance, resource, resource instance — with the most specific value
//! winning per attribute. A notification is due when the `pmin` gate is
//! open AND (`pmax` expired OR a value-change condition fired). While
//! offline in queue mode, due notifications are serialized into a
//! bounded per-observation queue (`hqmax`, newest evicts oldest).

use core::fmt::Write as _;

use newt_msg::{Code, ContentFormat, NotificationAttrs, Presence, Token, UriPath};
use std_alloc::collections::VecDeque;
use std_alloc::string::String;
use std_alloc::vec::Vec;

use crate::dm::{senml, text, Registry, Value};

/// Most simultaneous observations per session.
pub const MAX_OBSERVATIONS: usize = 16;

/// Most stored write-attribute records per session.
pub const MAX_ATTR_RECORDS: usize = 16;

/// Data-model change kinds reported through
/// [`crate::session::Session::data_model_changed`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChangeKind {
  /// A resource / resource-instance value changed
  ValueChanged,
  /// An object instance or resource instance appeared
  Added,
  /// An object instance or resource instance vanished
  Deleted,
}

/// Per-server scheduling inputs, mirrored from the Server object.
#[derive(Copy, Clone, Debug)]
pub struct ServerState {
  /// The server's short id
  pub ssid: u16,
  /// Whether the transport towards this server is up
  pub online: bool,
  /// `/1/x/2` default minimum period, seconds
  pub default_pmin: u32,
  /// `/1/x/3` default maximum period, seconds (0 = none)
  pub default_pmax: u32,
  /// `/1/x/6` notification storing while offline
  pub notify_store: bool,
  /// `/1/x/26` default notification mode (0 = NON, 1 = CON)
  pub default_con: u32,
}

impl Default for ServerState {
  fn default() -> Self {
    Self { ssid: 1,
           online: true,
           default_pmin: 0,
           default_pmax: 0,
           notify_store: false,
           default_con: 0 }
  }
}

#[derive(Clone, Debug)]
struct Observation {
  ssid: u16,
  path: UriPath,
  token: Token,
  observe_number: u32,
  accept: Option<ContentFormat>,
  /// Attributes attached to the Observe request itself
  own_attrs: NotificationAttrs,
  effective: NotificationAttrs,
  active: bool,
  last_notify_at: u64,
  last_eval_at: u64,
  last_sent: Option<f64>,
  /// Set by the dispatcher when anything under `path` changed
  pending: bool,
  /// Value snapshot staged when a notify is planned, committed on send
  staged: Option<f64>,
  /// Serialized notifications stored while offline
  queued: VecDeque<Vec<u8>>,
  /// Composite chain link (arena index of the previous member)
  prev: Option<usize>,
}

/// Everything the session needs to emit one notification.
#[derive(Clone, Debug, PartialEq)]
pub struct NotifyPlan {
  /// Arena slot, handed back in [`Observe::notify_result`]
  pub slot: usize,
  /// The observation's long-lived token
  pub token: Token,
  /// Observe option value for this notification
  pub observe_number: u32,
  /// Send as CON
  pub confirmable: bool,
  /// Serialized body
  pub payload: Vec<u8>,
  /// Body media type
  pub format: ContentFormat,
}

#[derive(Debug, Clone)]
struct AttrRecord {
  ssid: u16,
  path: UriPath,
  attrs: NotificationAttrs,
}

/// The observation arena plus write-attributes storage.
#[derive(Debug, Default)]
pub struct Observe {
  observations: Vec<Option<Observation>>,
  attrs: Vec<AttrRecord>,
}

impl Observe {
  /// An empty engine.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of live observations.
  pub fn count(&self) -> usize {
    self.observations.iter().filter(|o| o.is_some()).count()
  }

  fn slot_by_token(&self, token: &Token) -> Option<usize> {
    self.observations
        .iter()
        .position(|o| o.as_ref().map(|o| o.token == *token).unwrap_or(false))
  }

  fn free_slot(&mut self) -> Result<usize, Code> {
    if let Some(ix) = self.observations.iter().position(|o| o.is_none()) {
      return Ok(ix);
    }
    if self.observations.len() < MAX_OBSERVATIONS {
      self.observations.push(None);
      return Ok(self.observations.len() - 1);
    }
    Err(Code::INTERNAL_SERVER_ERROR)
  }

  /// Register (or refresh) an observation. Returns the observe number
  /// for the initial notify.
  #[allow(clippy::too_many_arguments)]
  pub fn observe(&mut self,
                 ssid: u16,
                 token: Token,
                 path: UriPath,
                 attrs: &NotificationAttrs,
                 accept: Option<ContentFormat>,
                 server: &ServerState,
                 reg: &mut Registry,
                 now: u64)
                 -> Result<u32, Code> {
    // same token again: replace the existing observation
    if let Some(ix) = self.slot_by_token(&token) {
      self.observations[ix] = None;
    }

    let slot = self.free_slot()?;
    let mut obs = Observation { ssid,
                                path,
                                token,
                                observe_number: 0,
                                accept,
                                own_attrs: *attrs,
                                effective: NotificationAttrs::default(),
                                active: false,
                                last_notify_at: now,
                                last_eval_at: now,
                                last_sent: None,
                                pending: false,
                                staged: None,
                                queued: VecDeque::new(),
                                prev: None };
    self.resolve_effective(&mut obs, server);
    obs.last_sent = read_numeric(reg, &obs.path);

    self.observations[slot] = Some(obs);
    Ok(0)
  }

  /// Register a composite observation over several paths sharing one
  /// token.
  #[cfg(feature = "composite")]
  #[allow(clippy::too_many_arguments)]
  pub fn observe_composite(&mut self,
                           ssid: u16,
                           token: Token,
                           paths: &[UriPath],
                           accept: Option<ContentFormat>,
                           server: &ServerState,
                           reg: &mut Registry,
                           now: u64)
                           -> Result<u32, Code> {
    if paths.is_empty() {
      return Err(Code::BAD_REQUEST);
    }

    // drop any previous chain under this token
    self.cancel_by_token(&token);

    let mut prev: Option<usize> = None;
    for path in paths {
      let slot = match self.free_slot() {
        | Ok(slot) => slot,
        | Err(code) => {
          self.cancel_by_token(&token);
          return Err(code);
        },
      };
      let mut obs = Observation { ssid,
                                  path: *path,
                                  token,
                                  observe_number: 0,
                                  accept,
                                  own_attrs: NotificationAttrs::default(),
                                  effective: NotificationAttrs::default(),
                                  active: false,
                                  last_notify_at: now,
                                  last_eval_at: now,
                                  last_sent: None,
                                  pending: false,
                                  staged: None,
                                  queued: VecDeque::new(),
                                  prev };
      self.resolve_effective(&mut obs, server);
      obs.last_sent = read_numeric(reg, path);
      self.observations[slot] = Some(obs);
      prev = Some(slot);
    }

    Ok(0)
  }

  /// Drop the observation(s) registered under `token`. Returns whether
  /// anything was removed.
  pub fn cancel_by_token(&mut self, token: &Token) -> bool {
    let mut removed = false;
    for slot in self.observations.iter_mut() {
      if slot.as_ref().map(|o| o.token == *token).unwrap_or(false) {
        *slot = None;
        removed = true;
      }
    }
    removed
  }

  /// Drop every observation and attribute record (session teardown or
  /// server change).
  pub fn clear(&mut self) {
    self.observations.clear();
    self.attrs.clear();
  }

  /// Store / merge a Write-Attributes request. Items that arrived
  /// present-but-unset clear the stored value.
  pub fn write_attr(&mut self,
                    ssid: u16,
                    path: UriPath,
                    incoming: &NotificationAttrs,
                    server: &ServerState,
                    reg: &mut Registry)
                    -> Result<(), Code> {
    let merged = match self.attr_record(ssid, &path) {
      | Some(existing) => merge_record(&existing, incoming),
      | None => merge_record(&NotificationAttrs::default(), incoming),
    };

    validate_attrs(&merged)?;

    if let Some(rec) = self.attrs
                           .iter_mut()
                           .find(|r| r.ssid == ssid && r.path == path)
    {
      if merged.any_present() {
        rec.attrs = merged;
      } else {
        let at = self.attrs
                     .iter()
                     .position(|r| r.ssid == ssid && r.path == path)
                     .unwrap_or(0);
        self.attrs.remove(at);
      }
    } else if merged.any_present() {
      if self.attrs.len() >= MAX_ATTR_RECORDS {
        return Err(Code::INTERNAL_SERVER_ERROR);
      }
      self.attrs.push(AttrRecord { ssid, path, attrs: merged });
    }

    // refresh affected observations; ones that just gained change-value
    // conditions snapshot the current value
    for ix in 0..self.observations.len() {
      let Some(mut obs) = self.observations[ix].take() else { continue };
      if obs.ssid == ssid && (path.is_ancestor_of(&obs.path) || obs.path.is_ancestor_of(&path)) {
        let had_conditions = has_conditions(&obs.effective);
        self.resolve_effective(&mut obs, server);
        if !had_conditions && has_conditions(&obs.effective) {
          obs.last_sent = read_numeric(reg, &obs.path);
        }
      }
      self.observations[ix] = Some(obs);
    }

    Ok(())
  }

  /// The attributes stored at exactly `(ssid, path)`, for Discover.
  pub fn attr_record(&self, ssid: u16, path: &UriPath) -> Option<NotificationAttrs> {
    self.attrs
        .iter()
        .find(|r| r.ssid == ssid && r.path == *path)
        .map(|r| r.attrs)
  }

  /// Effective attributes for `path`: server defaults overridden along
  /// the path chain, most specific last.
  pub fn effective_attrs(&self,
                         ssid: u16,
                         path: &UriPath,
                         server: &ServerState)
                         -> NotificationAttrs {
    let mut eff = NotificationAttrs::default();
    if server.default_pmin > 0 {
      eff.pmin = Presence::Value(server.default_pmin);
    }
    if server.default_pmax > 0 {
      eff.pmax = Presence::Value(server.default_pmax);
    }

    // walk root → leaf so deeper records override shallower ones
    for depth in 1..=path.len() {
      let prefix_ids = &path.ids()[..depth];
      if let Ok(prefix) = UriPath::from_ids(prefix_ids) {
        if let Some(rec) = self.attr_record(ssid, &prefix) {
          eff = merge_record(&eff, &rec);
        }
      }
    }

    eff
  }

  fn resolve_effective(&self, obs: &mut Observation, server: &ServerState) {
    let mut eff = self.effective_attrs(obs.ssid, &obs.path, server);
    eff = merge_record(&eff, &obs.own_attrs);
    obs.effective = eff;
    obs.active = true;
  }

  /// React to a data-model change: mark pending notifications, and on
  /// deletion drop observations / attributes under the vanished path.
  pub fn data_model_changed(&mut self, path: &UriPath, kind: ChangeKind) {
    match kind {
      | ChangeKind::Deleted => {
        for slot in self.observations.iter_mut() {
          if slot.as_ref()
                 .map(|o| path.is_ancestor_of(&o.path))
                 .unwrap_or(false)
          {
            *slot = None;
          }
        }
        self.attrs.retain(|r| !path.is_ancestor_of(&r.path));
      },
      | ChangeKind::ValueChanged | ChangeKind::Added => {
        for slot in self.observations.iter_mut().flatten() {
          if slot.path.is_ancestor_of(path) || path.is_ancestor_of(&slot.path) {
            slot.pending = true;
          }
        }
      },
    }
  }

  /// Find one observation that is due and build its notification.
  /// Offline with notification storing enabled, due notifications are
  /// queued instead (bounded by `hqmax`); they drain once online.
  pub fn process(&mut self,
                 now: u64,
                 server: &ServerState,
                 reg: &mut Registry)
                 -> Option<NotifyPlan> {
    // drain stored notifications first
    if server.online {
      for ix in 0..self.observations.len() {
        let Some(obs) = self.observations[ix].as_mut() else { continue };
        if obs.ssid != server.ssid && obs.ssid != crate::dm::SSID_ANY {
          continue;
        }
        if let Some(payload) = obs.queued.pop_front() {
          obs.observe_number += 1;
          return Some(NotifyPlan { slot: ix,
                                   token: obs.token,
                                   observe_number: obs.observe_number,
                                   confirmable: confirmable(obs, server),
                                   payload,
                                   format: body_format(obs),
                                   });
        }
      }
    }

    for ix in 0..self.observations.len() {
      let Some(obs) = self.observations[ix].as_ref() else { continue };
      if !obs.active || obs.prev.is_some() {
        // composite members fire through their chain head
        continue;
      }
      if obs.ssid != server.ssid && obs.ssid != crate::dm::SSID_ANY {
        continue;
      }

      if !self.is_due(ix, now, reg) {
        continue;
      }

      let Some((payload, format)) = self.render(ix, reg) else { continue };

      // the whole chain's pending flags are consumed by this notify
      let token = self.observations[ix].as_ref()?.token;
      for member in self.observations.iter_mut().flatten() {
        if member.token == token {
          member.pending = false;
        }
      }

      let obs = self.observations[ix].as_mut()?;
      obs.staged = read_numeric(reg, &obs.path);

      if !server.online {
        if server.notify_store {
          let cap = obs.effective
                       .hqmax
                       .value()
                       .copied()
                       .unwrap_or(u32::MAX)
                       .max(1) as usize;
          if obs.queued.len() >= cap {
            obs.queued.pop_front();
          }
          obs.queued.push_back(payload);
          obs.last_notify_at = now;
          if let Some(v) = obs.staged.take() {
            obs.last_sent = Some(v);
          }
        }
        continue;
      }

      obs.observe_number += 1;
      return Some(NotifyPlan { slot: ix,
                               token: obs.token,
                               observe_number: obs.observe_number,
                               confirmable: confirmable(obs, server),
                               payload,
                               format });
    }

    None
  }

  /// Commit (or roll back) scheduling state after the notify exchange
  /// completed. A peer Reset cancels the observation.
  pub fn notify_result(&mut self, slot: usize, now: u64, result: Result<(), crate::error::Error>) {
    let Some(Some(obs)) = self.observations.get_mut(slot) else { return };

    match result {
      | Ok(()) => {
        obs.last_notify_at = now;
        if let Some(v) = obs.staged.take() {
          obs.last_sent = Some(v);
        }
      },
      | Err(crate::error::Error::Reset) => {
        let token = obs.token;
        self.cancel_by_token(&token);
      },
      | Err(_) => {
        obs.staged = None;
        obs.pending = true;
      },
    }
  }

  /// Milliseconds until the earliest scheduled deadline, for the
  /// session's sleep hint.
  pub fn next_due_in(&self, now: u64) -> Option<u64> {
    let mut soonest: Option<u64> = None;

    for obs in self.observations.iter().flatten() {
      if !obs.active || obs.prev.is_some() {
        continue;
      }

      let mut candidate: Option<u64> = None;
      if let Some(pmax) = obs.effective.pmax.value() {
        if *pmax > 0 {
          candidate = Some(obs.last_notify_at + *pmax as u64 * 1000);
        }
      }
      if obs.pending {
        let gate = obs.effective
                      .pmin
                      .value()
                      .map(|p| obs.last_notify_at + *p as u64 * 1000)
                      .unwrap_or(now);
        candidate = Some(candidate.map(|c| c.min(gate)).unwrap_or(gate));
      }

      if let Some(c) = candidate {
        let dt = c.saturating_sub(now);
        soonest = Some(soonest.map(|s| s.min(dt)).unwrap_or(dt));
      }
    }

    soonest
  }

  fn is_due(&mut self, ix: usize, now: u64, reg: &mut Registry) -> bool {
    let Some(obs) = self.observations[ix].as_ref() else { return false };
    let eff = obs.effective;

    let pmin_open = eff.pmin
                       .value()
                       .map(|p| now >= obs.last_notify_at + *p as u64 * 1000)
                       .unwrap_or(true);
    if !pmin_open {
      return false;
    }

    if let Some(pmax) = eff.pmax.value() {
      if *pmax > 0 && now >= obs.last_notify_at + *pmax as u64 * 1000 {
        return true;
      }
    }

    let pending = obs.pending || self.chain_pending(ix);
    if !pending {
      return false;
    }

    if !has_conditions(&eff) {
      return true;
    }

    // epmin bounds how often the evaluator itself may run
    if let Some(epmin) = eff.epmin.value() {
      if now < obs.last_eval_at + *epmin as u64 * 1000 {
        return false;
      }
    }

    let path = obs.path;
    let last = obs.last_sent;
    let current = read_numeric(reg, &path);

    let Some(obs) = self.observations[ix].as_mut() else { return false };
    obs.last_eval_at = now;

    let (Some(last), Some(current)) = (last, current) else {
      // no numeric view: fall back to plain change semantics
      return true;
    };

    let fired = condition_fired(&eff, last, current);
    if !fired {
      // the change did not cross anything; wait for the next one
      obs.pending = false;
    }
    fired
  }

  fn chain_pending(&self, head: usize) -> bool {
    let token = match self.observations[head].as_ref() {
      | Some(o) => o.token,
      | None => return false,
    };
    self.observations
        .iter()
        .flatten()
        .any(|o| o.token == token && o.pending)
  }

  fn render(&self, ix: usize, reg: &mut Registry) -> Option<(Vec<u8>, ContentFormat)> {
    let obs = self.observations[ix].as_ref()?;
    let token = obs.token;

    let members: Vec<UriPath> = self.observations
                                    .iter()
                                    .flatten()
                                    .filter(|o| o.token == token)
                                    .map(|o| o.path)
                                    .collect();

    if members.len() == 1 && obs.path.len() >= 3
       && obs.accept == Some(ContentFormat::PLAIN_TEXT)
    {
      let value = reg.res_read(&obs.path).ok()?;
      return Some((text::encode(&value), ContentFormat::PLAIN_TEXT));
    }

    let mut doc = String::new();
    for path in members.iter() {
      if path.len() >= 3 {
        let value = reg.res_read(path).ok()?;
        senml::encode_entry(&mut doc, path, &value);
      } else {
        for target in crate::dm::linkfmt::enumerate(reg, path) {
          if target.len() < 3 {
            continue;
          }
          let Some(res) = reg.res_def(&target) else { continue };
          if !res.op.readable() || (res.op.multi() && target.len() == 3) {
            continue;
          }
          if let Ok(value) = reg.res_read(&target) {
            senml::encode_entry(&mut doc, &target, &value);
          }
        }
      }
    }
    if doc.is_empty() {
      let _ = write!(doc, "[]");
    }
    Some((doc.into_bytes(), ContentFormat::SENML_JSON))
  }
}

fn body_format(obs: &Observation) -> ContentFormat {
  if obs.path.len() >= 3 && obs.accept == Some(ContentFormat::PLAIN_TEXT) {
    ContentFormat::PLAIN_TEXT
  } else {
    ContentFormat::SENML_JSON
  }
}

fn confirmable(obs: &Observation, server: &ServerState) -> bool {
  match obs.effective.con {
    | Presence::Value(v) => v != 0,
    | _ => server.default_con != 0,
  }
}

fn has_conditions(attrs: &NotificationAttrs) -> bool {
  attrs.gt.value().is_some()
  || attrs.lt.value().is_some()
  || attrs.st.value().is_some()
  || attrs.edge.value().is_some()
}

fn condition_fired(attrs: &NotificationAttrs, last: f64, current: f64) -> bool {
  if let Some(gt) = attrs.gt.value() {
    if (last <= *gt && current > *gt) || (last >= *gt && current < *gt) {
      return true;
    }
  }
  if let Some(lt) = attrs.lt.value() {
    if (last >= *lt && current < *lt) || (last <= *lt && current > *lt) {
      return true;
    }
  }
  if let Some(st) = attrs.st.value() {
    if (current - last).abs() >= *st {
      return true;
    }
  }
  if let Some(edge) = attrs.edge.value() {
    let rising = last == 0.0 && current != 0.0;
    let falling = last != 0.0 && current == 0.0;
    if (*edge != 0 && rising) || (*edge == 0 && falling) {
      return true;
    }
  }
  false
}

fn validate_attrs(attrs: &NotificationAttrs) -> Result<(), Code> {
  if let (Some(lt), Some(gt)) = (attrs.lt.value(), attrs.gt.value()) {
    if lt >= gt {
      return Err(Code::BAD_REQUEST);
    }
    if let Some(st) = attrs.st.value() {
      if gt - lt <= 2.0 * st {
        return Err(Code::BAD_REQUEST);
      }
    }
  }
  if let Some(st) = attrs.st.value() {
    if *st < 0.0 {
      return Err(Code::BAD_REQUEST);
    }
  }
  if let (Some(pmin), Some(pmax)) = (attrs.pmin.value(), attrs.pmax.value()) {
    if *pmax > 0 && pmax < pmin {
      return Err(Code::BAD_REQUEST);
    }
  }
  Ok(())
}

/// Merge `incoming` over `base`: present wins, `Unset` clears.
fn merge_record(base: &NotificationAttrs, incoming: &NotificationAttrs) -> NotificationAttrs {
  fn merge<T: Copy>(base: Presence<T>, incoming: Presence<T>) -> Presence<T> {
    match incoming {
      | Presence::Absent => base,
      | Presence::Unset => Presence::Absent,
      | v => v,
    }
  }

  NotificationAttrs { pmin: merge(base.pmin, incoming.pmin),
                      pmax: merge(base.pmax, incoming.pmax),
                      gt: merge(base.gt, incoming.gt),
                      lt: merge(base.lt, incoming.lt),
                      st: merge(base.st, incoming.st),
                      epmin: merge(base.epmin, incoming.epmin),
                      epmax: merge(base.epmax, incoming.epmax),
                      edge: merge(base.edge, incoming.edge),
                      con: merge(base.con, incoming.con),
                      hqmax: merge(base.hqmax, incoming.hqmax) }
}

fn read_numeric(reg: &mut Registry, path: &UriPath) -> Option<f64> {
  if path.len() < 3 {
    return None;
  }
  reg.res_read(path).ok().and_then(|v| v.as_f64())
}

#[cfg(test)]
mod tests {
  use std_alloc::boxed::Box;

  use super::*;
  use crate::dm::test::{simple_obj, MapObj, OwnedValue};
  use crate::dm::{DataType, ResOp};

  fn sensor_registry(value: f64) -> Registry {
    let mut reg = Registry::new();
    let mut obj = MapObj::default();
    obj.values.insert((0, 5700, 0), OwnedValue::Double(value));
    reg.add(simple_obj(3303, &[0], &[(5700, ResOp::R, DataType::Double)]),
            Box::new(obj))
       .unwrap();
    reg
  }

  fn set_value(reg: &mut Registry, v: f64) {
    let path = UriPath::resource(3303, 0, 5700);
    let entry = reg.entry_mut(3303).unwrap();
    entry.handlers.res_write(&path, &Value::Double(v)).unwrap();
  }

  fn tok(b: u8) -> Token {
    Token::from_bytes(&[b]).unwrap()
  }

  fn pmin_pmax(pmin: u32, pmax: u32) -> NotificationAttrs {
    NotificationAttrs { pmin: Presence::Value(pmin),
                        pmax: Presence::Value(pmax),
                        ..Default::default() }
  }

  #[test]
  fn pmin_gates_pmax_forces() {
    // S4: pmin=20 pmax=1200, the sensor updates every second
    let mut reg = sensor_registry(20.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);

    engine.observe(1, tok(1), path, &pmin_pmax(20, 1200), None, &server, &mut reg, 0)
          .unwrap();

    let mut notified_at = vec![];
    for second in 1..=60u64 {
      let now = second * 1000;
      engine.data_model_changed(&path, ChangeKind::ValueChanged);
      if let Some(plan) = engine.process(now, &server, &mut reg) {
        notified_at.push(second);
        engine.notify_result(plan.slot, now, Ok(()));
      }
    }

    assert_eq!(notified_at, vec![20, 40, 60], "one notification per pmin window");
  }

  #[test]
  fn pmax_fires_without_changes() {
    let mut reg = sensor_registry(20.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);

    engine.observe(1, tok(1), path, &pmin_pmax(20, 1200), None, &server, &mut reg, 0)
          .unwrap();

    assert!(engine.process(1_199_000, &server, &mut reg).is_none());
    let plan = engine.process(1_200_000, &server, &mut reg).unwrap();
    assert_eq!(plan.observe_number, 1);
  }

  #[test]
  fn gt_crossing_fires_and_non_crossing_does_not() {
    let mut reg = sensor_registry(2.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);
    let attrs = NotificationAttrs { gt: Presence::Value(2.85),
                                    ..Default::default() };

    engine.observe(1, tok(1), path, &attrs, None, &server, &mut reg, 0).unwrap();

    // moves but stays below the threshold
    set_value(&mut reg, 2.5);
    engine.data_model_changed(&path, ChangeKind::ValueChanged);
    assert!(engine.process(1000, &server, &mut reg).is_none());

    // crosses upward
    set_value(&mut reg, 3.1);
    engine.data_model_changed(&path, ChangeKind::ValueChanged);
    let plan = engine.process(2000, &server, &mut reg).unwrap();
    engine.notify_result(plan.slot, 2000, Ok(()));

    // crossing back down fires again
    set_value(&mut reg, 2.0);
    engine.data_model_changed(&path, ChangeKind::ValueChanged);
    assert!(engine.process(3000, &server, &mut reg).is_some());
  }

  #[test]
  fn step_threshold() {
    let mut reg = sensor_registry(10.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);
    let attrs = NotificationAttrs { st: Presence::Value(5.0),
                                    ..Default::default() };

    engine.observe(1, tok(1), path, &attrs, None, &server, &mut reg, 0).unwrap();

    set_value(&mut reg, 12.0);
    engine.data_model_changed(&path, ChangeKind::ValueChanged);
    assert!(engine.process(1000, &server, &mut reg).is_none());

    set_value(&mut reg, 15.0);
    engine.data_model_changed(&path, ChangeKind::ValueChanged);
    assert!(engine.process(2000, &server, &mut reg).is_some(),
            "|15 - 10| >= 5 fires");
  }

  #[test]
  fn passive_observation_fires_on_any_change() {
    let mut reg = sensor_registry(1.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);

    engine.observe(1, tok(1), path, &NotificationAttrs::default(), None, &server, &mut reg, 0)
          .unwrap();

    assert!(engine.process(500, &server, &mut reg).is_none());
    engine.data_model_changed(&path, ChangeKind::ValueChanged);
    assert!(engine.process(600, &server, &mut reg).is_some());
  }

  #[test]
  fn attribute_inheritance_resource_wins() {
    let mut reg = sensor_registry(0.0);
    let mut engine = Observe::new();
    let server = ServerState { default_pmin: 5, ..ServerState::default() };

    engine.write_attr(1,
                      UriPath::object(3303),
                      &NotificationAttrs { pmin: Presence::Value(60),
                                           ..Default::default() },
                      &server,
                      &mut reg)
          .unwrap();
    engine.write_attr(1,
                      UriPath::resource(3303, 0, 5700),
                      &NotificationAttrs { pmin: Presence::Value(10),
                                           ..Default::default() },
                      &server,
                      &mut reg)
          .unwrap();

    let eff = engine.effective_attrs(1, &UriPath::resource(3303, 0, 5700), &server);
    assert_eq!(eff.pmin, Presence::Value(10), "resource-level wins");

    let eff_inst = engine.effective_attrs(1, &UriPath::resource(3303, 0, 9999), &server);
    assert_eq!(eff_inst.pmin, Presence::Value(60), "object-level inherited");

    let eff_other = engine.effective_attrs(1, &UriPath::resource(4, 0, 0), &server);
    assert_eq!(eff_other.pmin, Presence::Value(5), "server default");
  }

  #[test]
  fn unset_attribute_clears_stored_value() {
    let mut reg = sensor_registry(0.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);

    engine.write_attr(1, path, &pmin_pmax(20, 120), &server, &mut reg).unwrap();
    assert_eq!(engine.attr_record(1, &path).unwrap().pmin, Presence::Value(20));

    // "pmin" with no value clears it
    engine.write_attr(1,
                      path,
                      &NotificationAttrs { pmin: Presence::Unset,
                                           ..Default::default() },
                      &server,
                      &mut reg)
          .unwrap();
    let rec = engine.attr_record(1, &path).unwrap();
    assert_eq!(rec.pmin, Presence::Absent);
    assert_eq!(rec.pmax, Presence::Value(120), "others untouched");
  }

  #[test]
  fn invalid_attr_combinations_rejected() {
    let mut reg = sensor_registry(0.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);

    let bad = NotificationAttrs { gt: Presence::Value(1.0),
                                  lt: Presence::Value(2.0),
                                  ..Default::default() };
    assert_eq!(engine.write_attr(1, path, &bad, &server, &mut reg),
               Err(Code::BAD_REQUEST));
  }

  #[test]
  fn cancel_and_deletion_drop_observations() {
    let mut reg = sensor_registry(0.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);

    engine.observe(1, tok(1), path, &Default::default(), None, &server, &mut reg, 0)
          .unwrap();
    assert_eq!(engine.count(), 1);
    assert!(engine.cancel_by_token(&tok(1)));
    assert_eq!(engine.count(), 0);

    engine.observe(1, tok(2), path, &Default::default(), None, &server, &mut reg, 0)
          .unwrap();
    engine.write_attr(1, path, &pmin_pmax(1, 10), &server, &mut reg).unwrap();
    engine.data_model_changed(&UriPath::instance(3303, 0), ChangeKind::Deleted);
    assert_eq!(engine.count(), 0);
    assert!(engine.attr_record(1, &path).is_none());
  }

  #[test]
  fn offline_queue_respects_hqmax() {
    let mut reg = sensor_registry(1.0);
    let mut engine = Observe::new();
    let server = ServerState { online: false,
                               notify_store: true,
                               ..ServerState::default() };
    let path = UriPath::resource(3303, 0, 5700);
    let attrs = NotificationAttrs { hqmax: Presence::Value(2),
                                    ..Default::default() };

    engine.observe(1, tok(1), path, &attrs, None, &server, &mut reg, 0).unwrap();

    for (i, v) in [2.0f64, 3.0, 4.0].iter().enumerate() {
      set_value(&mut reg, *v);
      engine.data_model_changed(&path, ChangeKind::ValueChanged);
      assert!(engine.process((i as u64 + 1) * 1000, &server, &mut reg).is_none(),
              "stored, not sent");
    }

    // back online: only the newest two drain
    let online = ServerState { online: true, ..server };
    let first = engine.process(10_000, &online, &mut reg).unwrap();
    assert_eq!(first.payload, text_value(3.0));
    let second = engine.process(10_001, &online, &mut reg).unwrap();
    assert_eq!(second.payload, text_value(4.0));
    assert!(engine.process(10_002, &online, &mut reg).is_none());
  }

  fn text_value(v: f64) -> Vec<u8> {
    let mut doc = String::new();
    senml::encode_entry(&mut doc, &UriPath::resource(3303, 0, 5700), &Value::Double(v));
    doc.into_bytes()
  }

  #[cfg(feature = "composite")]
  #[test]
  fn composite_notify_carries_all_paths() {
    let mut reg = sensor_registry(7.0);
    let mut obj = MapObj::default();
    obj.values.insert((0, 1, 0), OwnedValue::Int(3));
    reg.add(simple_obj(4, &[0], &[(1, ResOp::R, DataType::Int)]), Box::new(obj))
       .unwrap();

    let mut engine = Observe::new();
    let server = ServerState::default();
    let paths = [UriPath::resource(3303, 0, 5700), UriPath::resource(4, 0, 1)];

    engine.observe_composite(1, tok(9), &paths, None, &server, &mut reg, 0)
          .unwrap();
    assert_eq!(engine.count(), 2);

    engine.data_model_changed(&paths[1], ChangeKind::ValueChanged);
    let plan = engine.process(1000, &server, &mut reg).unwrap();
    let doc = core::str::from_utf8(&plan.payload).unwrap();
    assert!(doc.contains(r#""n":"/3303/0/5700""#));
    assert!(doc.contains(r#""n":"/4/0/1""#));

    // cancelling the token removes the whole chain
    assert!(engine.cancel_by_token(&tok(9)));
    assert_eq!(engine.count(), 0);
  }

  #[test]
  fn reset_result_cancels_observation() {
    let mut reg = sensor_registry(0.0);
    let mut engine = Observe::new();
    let server = ServerState::default();
    let path = UriPath::resource(3303, 0, 5700);

    engine.observe(1, tok(3), path, &Default::default(), None, &server, &mut reg, 0)
          .unwrap();
    engine.data_model_changed(&path, ChangeKind::ValueChanged);
    let plan = engine.process(1000, &server, &mut reg).unwrap();
    engine.notify_result(plan.slot, 1000, Err(crate::error::Error::Reset));
    assert_eq!(engine.count(), 0);
  }
}
