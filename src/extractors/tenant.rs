//! Extract the request host used for tenant resolution.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::HOST, request::Parts},
};

/// Set by proxies in front of the server; preferred over `Host`.
pub const FORWARDED_HOST_HEADER: &str = "X-Forwarded-Host";

/// Host from `X-Forwarded-Host` (first entry), else `Host`, else the request URI.
/// Empty when none is present; resolution then relies on the route slug or default tenant.
#[derive(Clone, Debug)]
pub struct RequestHost(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for RequestHost
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let host = header(FORWARDED_HOST_HEADER)
            .or_else(|| header(HOST.as_str()))
            .or_else(|| parts.uri.host().map(String::from))
            .unwrap_or_default();
        Ok(RequestHost(host))
    }
}
