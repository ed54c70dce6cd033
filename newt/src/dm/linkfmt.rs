//! CoRE link-format documents: the Register payload enumerating
//! installed objects / instances, and Discover responses with their
//! attributes.

use core::fmt::Write;

use newt_msg::{NotificationAttrs, Presence, UriPath};
use std_alloc::string::String;
use std_alloc::vec::Vec;

use super::{oid, Registry};

/// Render the Register / Update payload: every installed object except
/// Security, with version suffixes and instance entries, e.g.
/// `</1/0>,</3>;ver=1.1,</3/0>`.
pub(crate) fn register_payload(reg: &Registry) -> Vec<u8> {
  let mut doc = String::new();

  for entry in reg.objs.iter() {
    if entry.def.oid == oid::SECURITY {
      continue;
    }

    if let Some(ver) = entry.def.version {
      sep(&mut doc);
      let _ = write!(doc, "</{}>;ver={}", entry.def.oid, ver);
    } else if entry.def.insts.is_empty() {
      sep(&mut doc);
      let _ = write!(doc, "</{}>", entry.def.oid);
    }

    for inst in entry.def.insts.iter() {
      sep(&mut doc);
      let _ = write!(doc, "</{}/{}>", entry.def.oid, inst.iid);
    }
  }

  doc.into_bytes()
}

/// Render a Discover response for `target`: the target and its
/// descendants down to `depth` levels below it, each with the attributes
/// stored at exactly that path and `dim=` for multi-instance resources.
pub(crate) fn discover_payload(reg: &Registry,
                               target: &UriPath,
                               depth: Option<u32>,
                               attrs: &dyn Fn(&UriPath) -> Option<NotificationAttrs>)
                               -> Vec<u8> {
  let max_depth = depth.unwrap_or(3) as usize + target.len();
  let mut doc = String::new();

  for path in enumerate(reg, target) {
    if path.len() > max_depth {
      continue;
    }

    sep(&mut doc);
    let _ = write!(doc, "<{}>", path);

    if let Some(dim) = dim_of(reg, &path) {
      let _ = write!(doc, ";dim={}", dim);
    }
    if let Some(a) = attrs(&path) {
      write_attrs(&mut doc, &a);
    }
  }

  doc.into_bytes()
}

/// All paths at or under `target`, in ascending path order.
pub(crate) fn enumerate(reg: &Registry, target: &UriPath) -> Vec<UriPath> {
  let mut out = Vec::new();

  for entry in reg.objs.iter() {
    let obj_path = UriPath::object(entry.def.oid);
    if !(target.is_ancestor_of(&obj_path) || obj_path.is_ancestor_of(target)) {
      continue;
    }

    push_if_under(&mut out, target, obj_path);

    for inst in entry.def.insts.iter() {
      let inst_path = UriPath::instance(entry.def.oid, inst.iid);
      if !(target.is_ancestor_of(&inst_path) || inst_path.is_ancestor_of(target)) {
        continue;
      }
      push_if_under(&mut out, target, inst_path);

      for res in inst.resources.iter() {
        let res_path = UriPath::resource(entry.def.oid, inst.iid, res.rid);
        if !(target.is_ancestor_of(&res_path) || res_path.is_ancestor_of(target)) {
          continue;
        }
        push_if_under(&mut out, target, res_path);

        for riid in res.insts.iter() {
          let ri_path =
            UriPath::resource_instance(entry.def.oid, inst.iid, res.rid, *riid);
          push_if_under(&mut out, target, ri_path);
        }
      }
    }
  }

  out
}

fn push_if_under(out: &mut Vec<UriPath>, target: &UriPath, path: UriPath) {
  if target.is_ancestor_of(&path) {
    out.push(path);
  }
}

fn dim_of(reg: &Registry, path: &UriPath) -> Option<usize> {
  if path.len() != 3 {
    return None;
  }
  let res = reg.res_def(path)?;
  res.op.multi().then(|| res.insts.len())
}

fn sep(doc: &mut String) {
  if !doc.is_empty() {
    doc.push(',');
  }
}

fn write_attrs(doc: &mut String, a: &NotificationAttrs) {
  let mut u32_attr = |name: &str, p: &Presence<u32>| {
    if let Presence::Value(v) = p {
      let _ = write!(doc, ";{}={}", name, v);
    }
  };
  u32_attr("pmin", &a.pmin);
  u32_attr("pmax", &a.pmax);
  u32_attr("epmin", &a.epmin);
  u32_attr("epmax", &a.epmax);

  let mut f64_attr = |name: &str, p: &Presence<f64>| {
    if let Presence::Value(v) = p {
      let _ = write!(doc, ";{}={}", name, v);
    }
  };
  f64_attr("gt", &a.gt);
  f64_attr("lt", &a.lt);
  f64_attr("st", &a.st);

  if let Presence::Value(v) = a.con {
    let _ = write!(doc, ";con={}", v);
  }
  if let Presence::Value(v) = a.edge {
    let _ = write!(doc, ";edge={}", v);
  }
  if let Presence::Value(v) = a.hqmax {
    let _ = write!(doc, ";hqmax={}", v);
  }
}

#[cfg(test)]
mod tests {
  use std_alloc::boxed::Box;
  use std_alloc::vec;

  use super::super::test::{simple_obj, MapObj};
  use super::super::{DataType, ObjDef, ResOp};
  use super::*;

  fn registry() -> Registry {
    let mut reg = Registry::new();
    reg.add(simple_obj(0, &[0], &[(0, ResOp::R, DataType::Str)]),
            Box::new(MapObj::default()))
       .unwrap();
    reg.add(simple_obj(1, &[0], &[(1, ResOp::RW, DataType::Int)]),
            Box::new(MapObj::default()))
       .unwrap();
    reg.add(simple_obj(3, &[0], &[(0, ResOp::R, DataType::Str)]),
            Box::new(MapObj::default()))
       .unwrap();
    reg
  }

  #[test]
  fn register_payload_excludes_security() {
    let reg = registry();
    assert_eq!(register_payload(&reg), b"</1/0>,</3/0>".to_vec());
  }

  #[test]
  fn register_payload_with_version() {
    let mut reg = Registry::new();
    let mut def = simple_obj(3303, &[0, 2], &[(5700, ResOp::R, DataType::Double)]);
    def.version = Some("1.1");
    reg.add(def, Box::new(MapObj::default())).unwrap();

    assert_eq!(register_payload(&reg),
               b"</3303>;ver=1.1,</3303/0>,</3303/2>".to_vec());
  }

  #[test]
  fn register_payload_instanceless_object() {
    let mut reg = Registry::new();
    reg.add(ObjDef { oid: 55,
                     version: None,
                     max_insts: 4,
                     insts: vec![],
                     res_template: vec![] },
            Box::new(MapObj::default()))
       .unwrap();
    assert_eq!(register_payload(&reg), b"</55>".to_vec());
  }

  #[test]
  fn discover_instance_with_attrs() {
    let mut reg = Registry::new();
    reg.add(simple_obj(3,
                       &[0],
                       &[(1, ResOp::RW, DataType::Int), (2, ResOp::R, DataType::Int)]),
            Box::new(MapObj::default()))
       .unwrap();

    let stored = UriPath::resource(3, 0, 1);
    let attrs = move |p: &UriPath| {
      (*p == stored).then(|| NotificationAttrs { pmin: Presence::Value(10),
                                                 pmax: Presence::Value(60),
                                                 ..Default::default() })
    };

    let doc = discover_payload(&reg, &UriPath::instance(3, 0), None, &attrs);
    assert_eq!(doc,
               b"</3/0>,</3/0/1>;pmin=10;pmax=60,</3/0/2>".to_vec());
  }

  #[test]
  fn discover_depth_limits_output() {
    let reg = registry();
    let doc = discover_payload(&reg, &UriPath::object(3), Some(1), &|_| None);
    assert_eq!(doc, b"</3>,</3/0>".to_vec());
  }

  #[test]
  fn discover_reports_dim() {
    let mut reg = Registry::new();
    let mut def = simple_obj(16, &[0], &[]);
    def.insts[0].resources = vec![super::super::ResDef { rid: 0,
                                                         op: ResOp::RWM,
                                                         typ: DataType::Int,
                                                         insts: vec![0, 1, 3] }];
    reg.add(def, Box::new(MapObj::default())).unwrap();

    let doc = discover_payload(&reg, &UriPath::instance(16, 0), None, &|_| None);
    assert_eq!(doc, b"</16/0>,</16/0/0>;dim=3,</16/0/0/0>,</16/0/0/1>,</16/0/0/3>".to_vec());
  }
}
