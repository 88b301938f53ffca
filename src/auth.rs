//! Bearer-token gate for protected routes.

use crate::{
    errors::AppError,
    services::{
        auth_service::{AuthService, Claims},
        error::AuthError,
    },
};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};

/// Extractor that admits a request only if it carries a valid bearer token.
///
/// A missing or empty credential is rejected with 401; anything present but
/// unusable (wrong scheme, bad signature, expired) with 403.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Claims);

impl<S> FromRequestParts<S> for Authenticated
where
    AuthService: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let auth = AuthService::from_ref(state);
        Ok(Self(auth.verify(token)?))
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)
        .map(|value| value.to_str().map_err(|_| AuthError::Invalid))
        .transpose()?
        .map(str::trim)
        .unwrap_or_default();

    if value.is_empty() {
        return Err(AuthError::Missing);
    }

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            if token.is_empty() {
                Err(AuthError::Missing)
            } else {
                Ok(token)
            }
        }
        _ if value.eq_ignore_ascii_case("bearer") => Err(AuthError::Missing),
        _ => Err(AuthError::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/play/x");
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token(&parts(None)), Err(AuthError::Missing));
        assert_eq!(bearer_token(&parts(Some("  "))), Err(AuthError::Missing));
        assert_eq!(bearer_token(&parts(Some("Bearer"))), Err(AuthError::Missing));
        assert_eq!(bearer_token(&parts(Some("Bearer   "))), Err(AuthError::Missing));
        assert_eq!(bearer_token(&parts(Some("Basic abc"))), Err(AuthError::Invalid));
        assert_eq!(bearer_token(&parts(Some("bearer abc.def"))), Ok("abc.def"));
    }
}
