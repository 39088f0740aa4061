use std::future::{Ready, ready};

use actix_web::{
    Error,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header,
    web,
};
use futures_util::future::LocalBoxFuture;
use log::warn;
use subtle::ConstantTimeEq;

use crate::config::Secret;
use crate::error::{RelayError, VerifyError};
use crate::relay_state::RelayState;

/// Shared-secret check for protected routes.
#[derive(Debug, Clone, Default)]
pub struct AuthGuard {
    secret: Option<Secret>,
}

impl AuthGuard {
    pub fn new(secret: Option<Secret>) -> Self {
        AuthGuard {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Validates an `Authorization` header value. Always passes when no
    /// secret is configured.
    pub fn check(&self, authorization: Option<&str>) -> Result<(), RelayError> {
        if !self.is_enabled() {
            return Ok(());
        }
        match extract_token(authorization) {
            Some(token) if self.matches(token) => Ok(()),
            _ => Err(RelayError::Unauthorized),
        }
    }

    /// Explicit secret verification used by `/verify`. Unlike [`check`],
    /// this fails when no secret is configured.
    ///
    /// [`check`]: AuthGuard::check
    pub fn verify(&self, token: Option<&str>) -> Result<(), VerifyError> {
        match token.filter(|t| !t.is_empty()) {
            None => Err(VerifyError::Empty),
            Some(token) if self.matches(token) => Ok(()),
            Some(_) => Err(VerifyError::Invalid),
        }
    }

    fn matches(&self, token: &str) -> bool {
        let Some(secret) = &self.secret else {
            return false;
        };
        let expected = secret.expose().as_bytes();
        let provided = token.as_bytes();
        // length leaks, contents do not
        if expected.len() != provided.len() {
            return false;
        }
        expected.ct_eq(provided).into()
    }
}

/// Strips an optional `Bearer ` prefix from an `Authorization` header value.
pub fn extract_token(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?.trim_start();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

/// Rejects requests whose `Authorization` header does not carry the
/// configured secret. Reads the guard from the app's [`RelayState`].
pub struct RequireAuth;

impl<S, B> Transform<S, ServiceRequest> for RequireAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RequireAuthService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequireAuthService { service }))
    }
}

pub struct RequireAuthService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequireAuthService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let verdict = match req.app_data::<web::Data<RelayState>>() {
            Some(state) => {
                let authorization = req
                    .headers()
                    .get(header::AUTHORIZATION)
                    .and_then(|h| h.to_str().ok());
                state.auth.check(authorization)
            }
            None => Err(RelayError::Internal("relay state is not configured".to_string())),
        };

        if let Err(err) = verdict {
            warn!("Rejected {} {}: {}", req.method(), req.path(), err);
            let response = req.error_response(err).map_into_right_body();
            return Box::pin(async move { Ok(response) });
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(secret: &str) -> AuthGuard {
        AuthGuard::new(Some(Secret::new(secret)))
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(extract_token(Some("abc")), Some("abc"));
        assert_eq!(extract_token(Some("  Bearer  abc  ")), Some("abc"));
        assert_eq!(extract_token(Some("Bearer ")), None);
        assert_eq!(extract_token(Some("  Bearer   ")), None);
        assert_eq!(extract_token(Some("Bearer")), Some("Bearer"));
        assert_eq!(extract_token(None), None);
    }

    #[test]
    fn test_disabled_guard_passes_everything() {
        let guard = AuthGuard::new(None);
        assert!(!guard.is_enabled());
        assert!(guard.check(None).is_ok());
        assert!(guard.check(Some("Bearer whatever")).is_ok());

        let empty = AuthGuard::new(Some(Secret::new("")));
        assert!(!empty.is_enabled());
    }

    #[test]
    fn test_enabled_guard() {
        let guard = guard("s3cret");
        assert!(guard.check(Some("Bearer s3cret")).is_ok());
        assert!(guard.check(Some("s3cret")).is_ok());
        assert!(matches!(guard.check(None), Err(RelayError::Unauthorized)));
        assert!(matches!(
            guard.check(Some("Bearer s3cre")),
            Err(RelayError::Unauthorized)
        ));
        assert!(matches!(
            guard.check(Some("Bearer s3creT")),
            Err(RelayError::Unauthorized)
        ));
    }

    #[test]
    fn test_verify() {
        let guard = guard("s3cret");
        assert!(guard.verify(Some("s3cret")).is_ok());
        assert!(matches!(guard.verify(None), Err(VerifyError::Empty)));
        assert!(matches!(guard.verify(Some("")), Err(VerifyError::Empty)));
        assert!(matches!(
            guard.verify(Some("nope")),
            Err(VerifyError::Invalid)
        ));
    }

    #[test]
    fn test_verify_requires_exact_match() {
        let exact = guard("s3cret");
        assert!(matches!(
            exact.verify(Some("  s3cret  ")),
            Err(VerifyError::Invalid)
        ));
        assert!(matches!(
            exact.verify(Some(" ")),
            Err(VerifyError::Invalid)
        ));

        let padded = guard(" s3cret ");
        assert!(padded.is_enabled());
        assert!(padded.verify(Some(" s3cret ")).is_ok());
        assert!(matches!(
            padded.verify(Some("s3cret")),
            Err(VerifyError::Invalid)
        ));
    }

    #[test]
    fn test_whitespace_secret_enables_guard() {
        let guard = guard("   ");
        assert!(guard.is_enabled());
        assert!(matches!(guard.check(None), Err(RelayError::Unauthorized)));
        assert!(matches!(
            guard.check(Some("Bearer anything")),
            Err(RelayError::Unauthorized)
        ));
    }

    #[test]
    fn test_verify_without_secret_never_succeeds() {
        let guard = AuthGuard::new(None);
        assert!(matches!(
            guard.verify(Some("anything")),
            Err(VerifyError::Invalid)
        ));
    }
}
