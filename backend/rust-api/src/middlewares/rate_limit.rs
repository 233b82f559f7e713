use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::services::cache::ExpiringCache;
use crate::services::AppState;

const RATE_LIMIT_PER_LEARNER: u32 = 120; // requests per minute
const RATE_LIMIT_PER_IP: u32 = 300; // requests per minute
const RATE_WINDOW_SECONDS: u64 = 60;

pub(crate) fn extract_client_ip_from(
    headers: &HeaderMap,
    extensions: &axum::http::Extensions,
) -> String {
    // Preferred order: X-Forwarded-For, Forwarded, X-Real-IP, ConnectInfo
    if let Some(v) = headers.get("x-forwarded-for") {
        if let Ok(s) = v.to_str() {
            return s.split(',').next().unwrap_or(s).trim().to_string();
        }
    }

    if let Some(v) = headers.get("forwarded") {
        if let Ok(s) = v.to_str() {
            for part in s.split(';') {
                if let Some(val) = part.trim().strip_prefix("for=") {
                    return val.trim().trim_matches('"').to_string();
                }
            }
        }
    }

    if let Some(v) = headers.get("x-real-ip") {
        if let Ok(s) = v.to_str() {
            return s.trim().to_string();
        }
    }

    if let Some(ci) = extensions.get::<ConnectInfo<SocketAddr>>() {
        return ci.0.ip().to_string();
    }

    "unknown".to_string()
}

fn env_limit(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(default)
}

async fn enforce(cache: &dyn ExpiringCache, key: &str, limit: u32) -> Result<(), StatusCode> {
    let allowed = cache
        .hit_within_limit(key, limit, RATE_WINDOW_SECONDS)
        .await
        .map_err(|e| {
            tracing::error!("Rate limit check failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !allowed {
        tracing::warn!(key = %key, "Rate limit exceeded");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(())
}

/// General throttle for the learner surface, keyed by learner and by IP.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if std::env::var("RATE_LIMIT_DISABLED").unwrap_or_default() == "1" {
        tracing::debug!("Rate limiting disabled via RATE_LIMIT_DISABLED=1");
        return Ok(next.run(request).await);
    }

    let client_ip = extract_client_ip_from(request.headers(), request.extensions());
    let learner_id = request
        .extensions()
        .get::<super::auth::JwtClaims>()
        .map(|claims| claims.sub.clone());

    if let Some(learner_id) = &learner_id {
        enforce(
            state.cache.as_ref(),
            &format!("ratelimit:learner:{}", learner_id),
            env_limit("RATE_LIMIT_PER_LEARNER", RATE_LIMIT_PER_LEARNER),
        )
        .await?;
    }

    enforce(
        state.cache.as_ref(),
        &format!("ratelimit:ip:{}", client_ip),
        env_limit("RATE_LIMIT_PER_IP", RATE_LIMIT_PER_IP),
    )
    .await?;

    Ok(next.run(request).await)
}

/// Tighter per-learner throttle on attempt creation.
pub async fn start_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if std::env::var("RATE_LIMIT_DISABLED").unwrap_or_default() == "1" {
        return Ok(next.run(request).await);
    }

    let Some(learner_id) = request
        .extensions()
        .get::<super::auth::JwtClaims>()
        .map(|claims| claims.sub.clone())
    else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    enforce(
        state.cache.as_ref(),
        &format!("ratelimit:start:{}", learner_id),
        state.config.attempts.start_rate_limit_per_minute.max(1),
    )
    .await?;

    Ok(next.run(request).await)
}
