mod logging;
mod routes;
mod webhook;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{routing::get, routing::post, Router};
use gatekeeper_core::config::Settings;
use gatekeeper_core::db::Db;
use gatekeeper_core::dispatcher::{Dispatcher, Job};
use gatekeeper_core::engine::Engine;
use gatekeeper_core::git::{Mirror, RepoFacade};
use gatekeeper_core::host::HostFacade;
use gatekeeper_core::issue::{IssueTracker, NullIssueTracker};
use gatekeeper_hosts::{bitbucket::BitbucketHost, github::GithubHost, jira::JiraTracker, MockHost};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config_path = std::env::var("GATEKEEPER_CONFIG").unwrap_or_else(|_| "gatekeeper.yaml".to_string());
    let settings = Settings::load(&config_path)?;
    info!(
        repository = format!("{}/{}", settings.repository_owner, settings.repository_slug),
        host = settings.repository_host,
        "loaded configuration"
    );

    let lattice = settings.lattice()?;
    let host: Arc<dyn HostFacade> = build_host(&settings)?;
    let issue_tracker: Arc<dyn IssueTracker> = build_issue_tracker()?;

    let mirror = Mirror::new(settings.git_url.clone(), settings.cache_dir.clone());
    let repo = RepoFacade::new(mirror, Duration::from_secs(settings.command_timeout_s));

    let db = Arc::new(Db::open(&format!("{}/gatekeeper.sqlite3", settings.cache_dir))?);
    db.migrate()?;

    let engine = Arc::new(Engine::with_issue_tracker(settings.clone(), lattice, repo, host, issue_tracker, db.clone()));
    engine.recover().await?;

    let dispatcher = {
        let engine_for_worker = engine.clone();
        Arc::new(Dispatcher::spawn(db.clone(), move |job: Job| {
            let engine = engine_for_worker.clone();
            async move {
                match job {
                    Job::PullRequestJob(id) => engine.handle_pull_request_job(id).await,
                    Job::CommitJob(sha) => engine.handle_commit_job(&sha).await,
                    Job::TimerJob => engine.handle_timer_job().await,
                }
            }
        }))
    };
    dispatcher.spawn_timer(Duration::from_secs(settings.timer_interval_s));

    let state = Arc::new(AppState { settings: engine.settings.clone(), db, dispatcher, start_time: Instant::now() });

    let app = Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/status", get(routes::status))
        .route("/:host_name", post(routes::ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&engine.settings.bind_addr).await?;
    info!(addr = engine.settings.bind_addr, "gatekeeper listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server exited with an error");
        return Err(e.into());
    }
    Ok(())
}

/// Resolves `settings.repository_host` into a concrete [`HostFacade`].
/// Credentials are read from environment variables rather than the YAML
/// settings file: the recognized configuration options are all non-secret,
/// and tokens/app-passwords follow the convention that secrets live in the
/// environment, never in committed config.
fn build_host(settings: &Settings) -> anyhow::Result<Arc<dyn HostFacade>> {
    match settings.repository_host.as_str() {
        "github" => {
            let token = std::env::var("GATEKEEPER_GITHUB_TOKEN")
                .map_err(|_| anyhow::anyhow!("GATEKEEPER_GITHUB_TOKEN is required for repository_host: github"))?;
            Ok(Arc::new(GithubHost::new(
                settings.repository_owner.clone(),
                settings.repository_slug.clone(),
                token,
                settings.robot.username.clone(),
            )))
        }
        "bitbucket" => {
            let username = std::env::var("GATEKEEPER_BITBUCKET_USERNAME")
                .map_err(|_| anyhow::anyhow!("GATEKEEPER_BITBUCKET_USERNAME is required for repository_host: bitbucket"))?;
            let app_password = std::env::var("GATEKEEPER_BITBUCKET_APP_PASSWORD")
                .map_err(|_| anyhow::anyhow!("GATEKEEPER_BITBUCKET_APP_PASSWORD is required for repository_host: bitbucket"))?;
            Ok(Arc::new(BitbucketHost::new(
                settings.repository_owner.clone(),
                settings.repository_slug.clone(),
                username,
                app_password,
                settings.robot.username.clone(),
            )))
        }
        "mock" => Ok(Arc::new(MockHost::new(settings.robot.username.clone()))),
        other => anyhow::bail!("unknown repository_host: {other}"),
    }
}

/// Issue-tracker integration is entirely optional (the issue-tracker
/// client is an external collaborator, not part of the core): when
/// `GATEKEEPER_JIRA_URL` is unset, every PR's issue check falls back to a
/// presence-only check against [`NullIssueTracker`].
fn build_issue_tracker() -> anyhow::Result<Arc<dyn IssueTracker>> {
    let Ok(base_url) = std::env::var("GATEKEEPER_JIRA_URL") else {
        return Ok(Arc::new(NullIssueTracker));
    };
    let username = std::env::var("GATEKEEPER_JIRA_USERNAME")
        .map_err(|_| anyhow::anyhow!("GATEKEEPER_JIRA_USERNAME is required when GATEKEEPER_JIRA_URL is set"))?;
    let api_token = std::env::var("GATEKEEPER_JIRA_API_TOKEN")
        .map_err(|_| anyhow::anyhow!("GATEKEEPER_JIRA_API_TOKEN is required when GATEKEEPER_JIRA_URL is set"))?;
    Ok(Arc::new(JiraTracker::new(base_url, username, api_token)))
}
