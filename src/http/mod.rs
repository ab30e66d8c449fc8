//! HTTP request and response types.
//!
//! The connection runtime consumes these through a narrow surface: extract
//! the next complete request from a read buffer, and serialize a response.

mod request;
mod response;

pub use request::{parse_request, Method, Request};
pub use response::Response;
