use std::sync::Arc;

use axum::{
    Form, Router,
    extract::State,
    routing::{get, post},
};

use serde::Deserialize;
use tokio::net::TcpListener;

use crate::{
    config::Config,
    store::{RuleError, RuleStore},
};

#[derive(Deserialize)]
struct RuleForm {
    data: String,
}

#[derive(Deserialize)]
struct UpdateForm {
    #[serde(rename = "oldKey")]
    old_key: String,
    data: String,
}

#[derive(Deserialize)]
struct AddToForm {
    ip: String,
    to: String,
}

fn describe(result: Result<(), RuleError>) -> &'static str {
    match result {
        Ok(()) => "ok",
        Err(RuleError::Malformed) => "malformed rule, expected key::value",
        Err(RuleError::DuplicateSource) => "the forwarded IP is already configured",
        Err(RuleError::DuplicateBackend) => "the backend address is already configured",
        Err(RuleError::UnknownBackend) => "no rule has that backend address",
    }
}

/// start admin server
///
/// Plain-text CRUD over the rule store. Every successful mutation
/// persists the store and recycles the broker, so edits take effect on
/// the next broker generation.
///
/// Warn: This http server does not contain any means of authentication,
/// please do not expose it directly to an unsafe environment.
pub async fn start_server(config: Arc<Config>, store: Arc<RuleStore>) -> anyhow::Result<()> {
    let app = Router::new()
        .route(
            "/getConfig",
            get(|State(store): State<Arc<RuleStore>>| async move { store.to_json() }),
        )
        .route(
            "/add",
            post(
                |State(store): State<Arc<RuleStore>>, Form(form): Form<RuleForm>| async move {
                    describe(store.add(&form.data))
                },
            ),
        )
        .route(
            "/update",
            post(
                |State(store): State<Arc<RuleStore>>, Form(form): Form<UpdateForm>| async move {
                    describe(store.update(&form.old_key, &form.data))
                },
            ),
        )
        .route(
            "/addTo",
            post(
                |State(store): State<Arc<RuleStore>>, Form(form): Form<AddToForm>| async move {
                    describe(store.add_to(&form.ip, &form.to))
                },
            ),
        )
        .with_state(store);

    let listener = TcpListener::bind(config.api.bind).await?;

    log::info!("admin api listening: bind={}", config.api.bind);

    axum::serve(listener, app).await?;
    Ok(())
}
