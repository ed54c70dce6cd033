//! Zero-copy CoAP message codec for the option subset LwM2M uses.
//!
//! The central item is [`Message`]: one uniform structured form that the
//! UDP ([RFC 7252](https://datatracker.ietf.org/doc/html/rfc7252)) and TCP
//! ([RFC 8323](https://datatracker.ietf.org/doc/html/rfc8323)) codecs decode
//! into and encode from. Everything above this crate (the exchange engine,
//! the data-model dispatcher, the session state machine) operates on
//! `Message` and never touches wire bytes.
//!
//! ## Allocation
//! Decoding is zero-copy: the payload, Location-Path segments and attribute
//! strings of a decoded [`Message`] borrow from the caller's receive buffer.
//! Fixed-size fields (token, etag, uri path) are stored inline. No allocator
//! is required; the crate is `no_std` by default of its `std` feature being
//! disabled.
//!
//! ## Scope
//! Only the options LwM2M needs are understood (see [`opt`]). Unknown
//! critical options fail the parse with
//! [`ParseError::OptionUnsupported`]; unknown elective options are skipped.
//! The decoder additionally classifies each message into an LwM2M-level
//! [`Operation`] from its code, path shape, query and observe option.

// x-release-please-start-version
#![doc(html_root_url = "https://docs.rs/newt-msg/0.4.1")]
// x-release-please-end
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(not(test), forbid(missing_debug_implementations, unreachable_pub))]
#![cfg_attr(not(test), deny(unsafe_code))]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
#![deny(missing_docs)]

/// Uri-Query attribute payloads
pub mod attr;

/// Block1 / Block2 descriptors
pub mod block;

/// Message code (class.detail)
pub mod code;

/// Content-Format registry subset
pub mod content_format;

pub(crate) mod cursor;

/// ETag option value
pub mod etag;

/// Message ID
pub mod id;

/// The uniform message structure
pub mod msg;

/// LwM2M operation classification
pub mod op;

/// Option numbers & nibble-extended lengths
pub mod opt;

/// Parse / encode errors
pub mod parse_error;

/// Data-model URI paths
pub mod path;

/// CoAP-over-TCP framing
pub mod tcp;

/// Message token
pub mod token;

/// UDP message type (CON / NON / ACK / RST)
pub mod ty;

/// CoAP-over-UDP wire format
pub mod udp;

#[doc(inline)]
pub use attr::{Attrs, BootstrapAttrs, CreateAttrs, DiscoverAttrs, NotificationAttrs, Presence,
               RegisterAttrs};
#[doc(inline)]
pub use block::{Block, BlockKind};
#[doc(inline)]
pub use code::{Code, CodeKind};
#[doc(inline)]
pub use content_format::ContentFormat;
#[doc(inline)]
pub use etag::Etag;
#[doc(inline)]
pub use id::Id;
#[doc(inline)]
pub use msg::{Binding, LocationPath, Message, Signalling};
#[doc(inline)]
pub use op::Operation;
#[doc(inline)]
pub use parse_error::{EncodeError, ParseError};
#[doc(inline)]
pub use path::UriPath;
#[doc(inline)]
pub use tcp::{decode_tcp, encode_tcp, TcpStep};
#[doc(inline)]
pub use token::Token;
#[doc(inline)]
pub use ty::Type;
#[doc(inline)]
pub use udp::{decode_udp, encode_udp};
