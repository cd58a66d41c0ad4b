//! Authentication middleware.
//!
//! Order of precedence per request:
//! 1. a session cookie that hits the cache reuses its dataset list,
//! 2. otherwise the bearer token runs the full verification chain and a new
//!    session is minted.
//!
//! The dataset list lands in the request extensions under [`Datasets`]. A
//! `Set-Cookie` is only attached to successful responses of fresh
//! evaluations that yielded at least one dataset, so error paths never hand
//! out cookies.

use axum::{
    extract::{Request, State},
    http::header::{AUTHORIZATION, COOKIE, SET_COOKIE},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{oidc, token, visa};
use crate::config::SessionConfig;
use crate::handlers::AppState;
use crate::Error;

/// Dataset identifiers the caller may access, attached to the request.
#[derive(Debug, Clone)]
pub struct Datasets(pub Vec<String>);

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    // Check if dataset permissions are cached to a session.
    let mut cached = None;
    if let Some(session_key) = read_cookie(&request, &state.session_config.name) {
        tracing::debug!("session cookie received");
        cached = state.sessions.get(&session_key).await;
    }

    let from_cache = cached.is_some();
    let datasets = match cached {
        Some(datasets) => datasets,
        None => match evaluate_token(&state, request.headers()).await {
            Ok(datasets) => datasets,
            Err(err) => return err.into_response(),
        },
    };

    // An empty permission list only makes sense when listing datasets.
    if datasets.is_empty() && path != "/metadata/datasets" {
        tracing::debug!("token carries no dataset permissions matching the database");
        return Error::NoDatasets.into_response();
    }

    request.extensions_mut().insert(Datasets(datasets.clone()));
    let mut response = next.run(request).await;

    if !from_cache && !datasets.is_empty() && response.status().is_success() {
        let key = state.sessions.new_key();
        state.sessions.set(&key, datasets).await;
        if let Ok(value) = HeaderValue::from_str(&build_cookie(&state.session_config, &key)) {
            response.headers_mut().append(SET_COOKIE, value);
        }
        tracing::debug!("authorization check passed, new session created");
    }

    response
}

/// Full verification chain: bearer parse, signature check against the OIDC
/// keyset, passport fetch, visa evaluation.
async fn evaluate_token(
    state: &AppState,
    headers: &axum::http::HeaderMap,
) -> crate::Result<Vec<String>> {
    tracing::debug!("no session found, evaluating token");

    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let bearer = token::parse_bearer(header)?.to_string();

    let keys = state.keysets.get(&state.oidc.jwks_uri).await?;
    token::verify_token(&bearer, &keys, Some(&state.oidc.issuer))?;

    let passport = oidc::fetch_userinfo(&state.http_client, &state.oidc, &bearer).await?;
    visa::evaluate(
        &passport,
        &state.trust,
        &state.keysets,
        state.store.as_ref(),
    )
    .await
}

/// Find a cookie by name across all `Cookie` headers.
fn read_cookie(request: &Request, name: &str) -> Option<String> {
    for header in request.headers().get_all(COOKIE) {
        let Ok(value) = header.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((key, val)) = pair.trim().split_once('=') {
                if key == name && !val.is_empty() {
                    return Some(val.to_string());
                }
            }
        }
    }
    None
}

fn build_cookie(config: &SessionConfig, key: &str) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}",
        config.name,
        key,
        config.expiration.as_secs()
    );
    if !config.domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(&config.domain);
    }
    if config.secure {
        cookie.push_str("; Secure");
    }
    if config.httponly {
        cookie.push_str("; HttpOnly");
    }
    cookie
}
