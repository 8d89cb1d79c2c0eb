//! Wire protocol for the cradle runtime.
//!
//! Two planes share this crate:
//!
//! - **Control framing** ([`control`]): length-prefixed tagged records with a
//!   numeric opcode, a correlation id and a JSON body. Used on the proxy
//!   command socket and on the agent control channel.
//! - **Stream framing** ([`stream`]): sequence-tagged packets multiplexing
//!   many stdio streams over the single agent I/O channel.
//!
//! [`client`] provides the typed client both the runtime and the shim use to
//! talk to the proxy, including SCM_RIGHTS descriptor transfer ([`fdpass`]).

pub mod client;
pub mod control;
pub mod error;
pub mod fdpass;
pub mod stream;
pub mod types;

pub use client::ProxyClient;
pub use control::{
    read_message, write_message, ControlDecoder, ControlMessage, Opcode, NOTIFICATION_CORR,
};
pub use error::ProtocolError;
pub use stream::{fragment, write_frame, StreamDecoder, StreamFrame, DEFAULT_MAX_PAYLOAD};
