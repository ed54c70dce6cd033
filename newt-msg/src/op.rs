/// The LwM2M-level meaning of a message, computed on decode from its code,
/// path shape, query, payload presence and observe option; fixed by the
/// caller on encode.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
#[allow(missing_docs)]
pub enum Operation {
  #[default]
  None,
  // Bootstrap interface
  BootstrapReq,
  BootstrapFinish,
  BootstrapPackReq,
  // Registration interface
  Register,
  Update,
  Deregister,
  // Device management interface
  DmRead,
  DmReadComp,
  DmDiscover,
  DmWriteReplace,
  DmWritePartial,
  DmWriteAttr,
  DmWriteComp,
  DmExecute,
  DmCreate,
  DmDelete,
  // Information reporting interface
  InfObserve,
  InfObserveComp,
  InfCancelObserve,
  InfCancelObserveComp,
  InfInitialNotify,
  InfConNotify,
  InfNonConNotify,
  InfConSend,
  InfNonConSend,
  /// A piggybacked / separate / non-confirmable response
  Response,
  // CoAP-level messages
  CoapReset,
  CoapPingUdp,
  CoapEmptyMsg,
  // TCP signalling
  CoapCsm,
  CoapPing,
  CoapPong,
  CoapRelease,
  CoapAbort,
}

impl Operation {
  /// Whether this operation mutates the data model.
  pub fn is_write_like(&self) -> bool {
    matches!(self,
             Operation::DmWriteReplace
             | Operation::DmWritePartial
             | Operation::DmWriteAttr
             | Operation::DmWriteComp
             | Operation::DmCreate
             | Operation::DmDelete)
  }

  /// Whether this is a composite (path-list) operation.
  pub fn is_composite(&self) -> bool {
    matches!(self,
             Operation::DmReadComp
             | Operation::DmWriteComp
             | Operation::InfObserveComp
             | Operation::InfCancelObserveComp)
  }

  /// Whether this operation is a notification.
  pub fn is_notify(&self) -> bool {
    matches!(self,
             Operation::InfInitialNotify | Operation::InfConNotify | Operation::InfNonConNotify)
  }
}
