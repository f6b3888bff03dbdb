pub mod api;
pub mod config;
pub mod server;
pub mod store;

use std::sync::Arc;

use tokio::sync::mpsc;

use self::{config::Config, store::RuleStore};

/// Boot the whole server: the rule store, the admin surface, and the
/// supervised broker. Split out of `main` so integration tests can start
/// the server in-process.
///
/// Returns only when one of the two long-running halves gives up: the
/// admin listener failing, or the broker exhausting its restart budget.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let (restart, restarts) = mpsc::channel(1);
    let store = Arc::new(RuleStore::load(&config.rules, restart)?);

    let api = api::start_server(config.clone(), store.clone());
    let supervisor = server::run(config, store, restarts);

    tokio::select! {
        result = api => result,
        result = supervisor => result,
    }
}
