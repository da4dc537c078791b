//! HTTP routes: the webhook ingress and a minimal status page, following a
//! plain-handler-plus-`AppState` style.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use base64::Engine;
use gatekeeper_core::config::Settings;
use gatekeeper_core::db::Db;
use gatekeeper_core::dispatcher::Dispatcher;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::webhook::{self, HostName, Ingested};

pub struct AppState {
    pub settings: Settings,
    pub db: Arc<Db>,
    pub dispatcher: Arc<Dispatcher>,
    pub start_time: std::time::Instant,
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `(owner, slug)` are validated per-event inside `webhook::ingest_*`; a
/// mismatch returns 5xx to surface misconfiguration, not a quiet 2xx, since
/// a webhook delivered to the wrong bot instance is almost always a
/// routing mistake worth paging on.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Path(host_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !basic_auth_ok(&state.settings, &headers) {
        return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }

    let Some(host) = HostName::parse(&host_name) else {
        return (StatusCode::NOT_FOUND, format!("unknown host {host_name}")).into_response();
    };

    let body: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")).into_response(),
    };

    let owner = &state.settings.repository_owner;
    let slug = &state.settings.repository_slug;

    let outcome = match host {
        HostName::Github => {
            let event_type = headers
                .get("x-github-event")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            webhook::ingest_github(event_type, &body, owner, slug)
        }
        HostName::Bitbucket => {
            let event_key = headers
                .get("x-event-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            webhook::ingest_bitbucket(event_key, &body, owner, slug)
        }
    };

    match outcome {
        Ingested::Job(job) => {
            info!(?job, "enqueueing job from webhook delivery");
            state.dispatcher.enqueue(job).await;
            StatusCode::ACCEPTED.into_response()
        }
        Ingested::Ignored(reason) => {
            info!(%reason, "webhook delivery intentionally ignored");
            StatusCode::OK.into_response()
        }
        Ingested::WrongRepository => {
            warn!(owner, slug, "webhook delivery for a repository this instance is not configured for");
            (StatusCode::INTERNAL_SERVER_ERROR, "misconfigured repository routing").into_response()
        }
    }
}

fn basic_auth_ok(settings: &Settings, headers: &HeaderMap) -> bool {
    if settings.webhook_username.is_empty() && settings.webhook_password.is_empty() {
        return true;
    }
    let Some(raw) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = raw.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    user == settings.webhook_username && pass == settings.webhook_password
}

/// A point-in-time snapshot of dispatcher/queue health — not a live
/// dashboard.
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let jobs = state.db.list_recent_jobs(25).unwrap_or_default();
    let mut queues = serde_json::Map::new();
    if let Ok(lattice) = state.settings.lattice() {
        for version in lattice.versions() {
            let entries = state.db.list_queue_snapshot(&version.to_string()).unwrap_or_default();
            queues.insert(
                version.to_string(),
                json!(entries
                    .into_iter()
                    .map(|e| json!({"pr_id": e.pr_id, "sha": e.sha, "position": e.position}))
                    .collect::<Vec<_>>()),
            );
        }
    }
    Json(json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "repository": format!("{}/{}", state.settings.repository_owner, state.settings.repository_slug),
        "build_key": state.settings.build_key,
        "recent_jobs": jobs.into_iter().map(|j| json!({
            "id": j.id,
            "kind": j.kind,
            "key": j.job_key,
            "status": j.status,
            "attempt": j.attempt,
            "last_error": j.last_error,
        })).collect::<Vec<_>>(),
        "queues": queues,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn settings_with_auth(user: &str, pass: &str) -> Settings {
        let yaml = format!(
            "repository_host: mock\nrepository_owner: acme\nrepository_slug: widgets\nrobot:\n  username: gatekeeper-bot\nrobot_email: bot@acme.test\nwebhook_username: {user}\nwebhook_password: {pass}\n"
        );
        Settings::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn basic_auth_accepts_correct_credentials() {
        let settings = settings_with_auth("bot", "secret");
        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("bot:secret");
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_str(&format!("Basic {encoded}")).unwrap());
        assert!(basic_auth_ok(&settings, &headers));
    }

    #[test]
    fn basic_auth_rejects_wrong_password() {
        let settings = settings_with_auth("bot", "secret");
        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("bot:wrong");
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_str(&format!("Basic {encoded}")).unwrap());
        assert!(!basic_auth_ok(&settings, &headers));
    }

    #[test]
    fn basic_auth_rejects_missing_header() {
        let settings = settings_with_auth("bot", "secret");
        assert!(!basic_auth_ok(&settings, &HeaderMap::new()));
    }
}
