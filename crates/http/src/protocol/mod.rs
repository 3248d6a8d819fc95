//! Core HTTP/1.x protocol types shared by the codec and connection layers.
//!
//! # Architecture
//!
//! The protocol module collects the pieces that do not touch sockets or
//! buffers directly:
//!
//! - **Request data** ([`request`]): the parsed start line ([`RequestLine`])
//!   and header-derived predicates (connection tokens, `Expect: 100-continue`).
//!
//! - **Response data** ([`response`]): which statuses can carry a body and
//!   how reason phrases fall back for unknown codes.
//!
//! - **Body framing** ([`body`]): [`BodyKind`] and the precedence rules that
//!   pick a framing strategy from the request headers.
//!
//! - **Errors** ([`error`]): [`ParseError`] and [`SendError`]. Parse errors
//!   are terminal for a connection; send errors distinguish the first
//!   transport failure from the aborted writes that follow it.
//!
//! Everything here is plain data and pure functions, which keeps the framing
//! rules testable without a socket in sight.

mod request;
pub use request::RequestLine;
pub use request::connection_has_token;
pub use request::expects_continue;

mod response;
pub use response::status_can_have_body;

mod error;
pub use error::BoxError;
pub use error::ParseError;
pub use error::SendError;

pub mod body;
pub use body::BodyKind;
