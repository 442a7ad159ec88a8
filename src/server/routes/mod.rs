//! Route handlers, one module per endpoint family. `server::mod` wires these
//! into the dispatcher; each `handle` takes the shared `AppState` plus
//! whatever the request needs and returns a `hyper::Response<Body>` directly
//! rather than a `Result`, since every handler maps its own errors to a
//! response via `response_helpers::app_error_response`.

pub mod copy;
pub mod create;
pub mod delete;
pub mod generate;
pub mod health;
pub mod pull;
pub mod push;
pub mod tags;
