//! Framework adapters.
//!
//! The core contract every adapter wraps is
//! [`IdentityExtractor::resolve`](crate::identity::IdentityExtractor::resolve):
//! call it once per request, expose the result through the framework's own
//! per-request mechanism, reject with an unauthorized response where a route
//! requires a user, and never cache a record beyond the request.

pub mod axum;

pub use self::axum::{MaybeUser, identity_layer};
