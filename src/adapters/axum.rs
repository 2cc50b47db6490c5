//! Axum adapter: extractors over the identity-resolution contract.
//!
//! Attach [`identity_layer`] to a router, then take [`UserRecord`] as a
//! handler argument for routes that require a user (rejects with 401) or
//! [`MaybeUser`] where anonymous access is fine. Resolution runs per
//! request; nothing is cached.

use crate::identity::{IdentityExtractor, UserRecord};
use axum::Extension;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use std::convert::Infallible;
use std::sync::Arc;

/// Layer that makes an explicitly owned [`IdentityExtractor`] available to
/// the extractors below. There is no ambient instance; each router gets the
/// one it was built with.
pub fn identity_layer(extractor: Arc<IdentityExtractor>) -> Extension<Arc<IdentityExtractor>> {
    Extension(extractor)
}

impl<S: Send + Sync> FromRequestParts<S> for UserRecord {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let extractor = parts
            .extensions
            .get::<Arc<IdentityExtractor>>()
            // Missing layer is a wiring bug, not an auth failure.
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
        extractor
            .resolve(&parts.headers)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Non-rejecting variant: `None` for unauthenticated (or unproxied)
/// requests.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<UserRecord>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .extensions
            .get::<Arc<IdentityExtractor>>()
            .and_then(|extractor| extractor.resolve(&parts.headers));
        Ok(MaybeUser(user))
    }
}
