//! Process logging: `tracing` + `tracing-subscriber` with an `EnvFilter`.
//! This server's status page is a point-in-time snapshot, not a live log
//! tail.

pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gatekeeper_server=info,gatekeeper_core=info,gatekeeper_hosts=info,tower_http=warn".into());

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
