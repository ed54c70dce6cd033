//! A steppable LwM2M 1.1 client runtime on top of [`newt_msg`].
//!
//! The entry point is [`session::Session`]: one aggregate value holding
//! the object registry, the observation engine, exactly one in-flight
//! exchange and the message buffers. The application calls
//! [`session::Session::step`] from its main loop — every call is
//! non-blocking, and [`session::Session::next_step_time`] says how long
//! the loop may sleep.
//!
//! Layering, leaves first:
//!
//! ```text
//!   session  — bootstrap / register / update / queue mode / send
//!   dm + observe — dispatching server requests, notifications
//!   exchange — one request/response: retransmit, blocks, dedup
//!   newt-msg — CoAP codec (UDP + TCP)
//! ```
//!
//! There is no task runtime and no `async`: waiting is a state, not a
//! suspension, which keeps the engine steppable on deeply embedded
//! targets and makes retransmission timing deterministic under test.
//!
//! Time comes from an injected [`embedded_time::Clock`]; transport I/O
//! goes through the [`net::Transport`] trait in [`nb`] style.

// docs
#![doc(html_root_url = "https://docs.rs/newt/0.4.1")]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
// -
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]
// -
// features
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc as std_alloc;

/// Session & transmission configuration
pub mod config;

/// The data model: registry, dispatch, payload codecs
pub mod dm;

/// Crate-wide error union
pub mod error;

/// The per-interaction exchange engine
pub mod exchange;

/// The transport contract
pub mod net;

/// Observations & notification scheduling
pub mod observe;

/// The top-level client session
pub mod session;

/// Clock plumbing
pub mod time;

#[doc(inline)]
pub use config::{Config, TxParams};
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use net::{Transport, TransportState};
#[doc(inline)]
pub use observe::ChangeKind;
#[doc(inline)]
pub use session::{ConnStatus, Session};
