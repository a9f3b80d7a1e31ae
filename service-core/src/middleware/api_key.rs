use crate::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared-secret guard for device/bridge callers.
///
/// Requests whose path starts with `protected_prefix` must carry the
/// configured key in `X-API-KEY`; paths listed in `excluded_paths` are let
/// through unauthenticated.
#[derive(Clone, Debug, Default)]
pub struct ApiKeyConfig {
    pub api_key: String,
    pub protected_prefix: String,
    pub excluded_paths: Vec<String>,
}

impl ApiKeyConfig {
    fn requires_key(&self, path: &str) -> bool {
        path.starts_with(&self.protected_prefix) && !self.excluded_paths.iter().any(|p| p == path)
    }
}

pub async fn api_key_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<ApiKeyConfig> + Clone + Send + Sync + 'static,
{
    let config = state.as_ref();

    if !config.requires_key(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");

    if provided.is_empty() {
        tracing::warn!(path = %req.uri().path(), "Missing API key for bridge request");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Missing API key. Provide X-API-KEY header."
        )));
    }

    let matches: bool = provided
        .as_bytes()
        .ct_eq(config.api_key.as_bytes())
        .into();
    if !matches {
        tracing::warn!(path = %req.uri().path(), "Invalid API key for bridge request");
        return Err(AppError::Unauthorized(anyhow::anyhow!("Invalid API key.")));
    }

    Ok(next.run(req).await)
}
