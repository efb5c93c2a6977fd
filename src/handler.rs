//! HTTP surface through which an external decision engine publishes decisions.

use std::sync::Arc;

use axum::{extract, http::StatusCode, response, routing, Router};
use tower_http::trace::TraceLayer;

use crate::{
    decider::{Decision, MemoryDeciders},
    key::ResourceKey,
};

pub fn create_app(deciders: Arc<MemoryDeciders>) -> Router {
    Router::new()
        .route("/ping", routing::get(ping))
        .route(
            "/decisions/:namespace/:name",
            routing::get(get_decision)
                .put(put_decision)
                .delete(delete_decision),
        )
        .layer(extract::Extension(deciders))
        .layer(TraceLayer::new_for_http())
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("no decision for `{0}`")]
    DecisionNotFound(ResourceKey),
    #[error("desired scale must not be negative, got {0}")]
    NegativeScale(i32),
}

impl response::IntoResponse for Error {
    fn into_response(self) -> response::Response {
        let status_code = match self {
            Error::DecisionNotFound(_) => StatusCode::NOT_FOUND,
            Error::NegativeScale(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (status_code, self.to_string()).into_response()
    }
}

type ResultResponse<T> = Result<T, Error>;

async fn ping() -> &'static str {
    "ok"
}

async fn get_decision(
    extract::Extension(deciders): extract::Extension<Arc<MemoryDeciders>>,
    extract::Path((namespace, name)): extract::Path<(String, String)>,
) -> ResultResponse<response::Json<Decision>> {
    let key = ResourceKey::new(namespace, name);
    deciders
        .decision(&key)
        .map(response::Json)
        .ok_or(Error::DecisionNotFound(key))
}

async fn put_decision(
    extract::Extension(deciders): extract::Extension<Arc<MemoryDeciders>>,
    extract::Path((namespace, name)): extract::Path<(String, String)>,
    extract::Json(decision): extract::Json<Decision>,
) -> ResultResponse<StatusCode> {
    if decision.desired_scale < 0 {
        return Err(Error::NegativeScale(decision.desired_scale));
    }
    let key = ResourceKey::new(namespace, name);
    tracing::debug!(%key, ?decision, "decision received");
    deciders.record(key, decision);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_decision(
    extract::Extension(deciders): extract::Extension<Arc<MemoryDeciders>>,
    extract::Path((namespace, name)): extract::Path<(String, String)>,
) -> ResultResponse<StatusCode> {
    let key = ResourceKey::new(namespace, name);
    deciders
        .forget_decision(&key)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or(Error::DecisionNotFound(key))
}
