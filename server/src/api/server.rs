//! Router composition and the axum serve loop.

use std::net::SocketAddr;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Router, middleware};
use tokio::net::TcpListener;

use crate::api::auth::{self, AuthState};
use crate::api::error::ApiError;
use crate::api::routes::{publish, subscribe, work};
use crate::api::{AppState, routes};
use crate::app::CoreApp;

pub struct ApiServer {
    app: CoreApp,
}

impl ApiServer {
    pub fn new(app: CoreApp) -> Self {
        Self { app }
    }

    /// Binds and serves the hub's HTTP surface until the shutdown signal
    /// fires, then returns the app for the caller to finish draining
    /// background tasks.
    pub async fn start(self) -> Result<CoreApp> {
        let Self { app } = self;
        let state = app.state();

        let auth_state = AuthState {
            task_queue_secret: app.task_queue_secret.clone(),
            dev_mode: app.config.server.dev,
        };

        let public_routes = Router::new()
            .route("/subscribe", post(subscribe::post))
            .route("/publish", post(publish::post))
            .route("/", post(multiplex))
            .with_state(state.clone());

        let work_routes = Router::new()
            .route("/work/subscriptions", post(work::subscriptions))
            .route("/work/pull_feeds", post(work::pull_feeds))
            .route("/work/push_events", post(work::push_events))
            .route(
                "/work/poll_bootstrap",
                get(work::poll_bootstrap_trigger).post(work::poll_bootstrap_continue),
            )
            .route("/work/event_cleanup", get(work::event_cleanup))
            .with_state(state)
            .layer(middleware::from_fn_with_state(auth_state, auth::require_work_auth));

        let router = public_routes.merge(work_routes);

        let addr: SocketAddr = format!("{}:{}", app.config.server.host, app.config.server.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, dev = app.config.server.dev, "hub listening");

        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(app.shutdown.wait())
            .await?;

        Ok(app)
    }
}

/// `POST /`: multiplexes on `hub.mode`, mirroring the original hub's single
/// endpoint surface (spec §6).
async fn multiplex(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let form = routes::parse_form(&body);
    match routes::form_first(&form, "hub.mode") {
        Some("publish") => publish::handle(&state, &form).await,
        Some("subscribe") | Some("unsubscribe") => subscribe::handle(&state, &form).await,
        Some(other) => Err(ApiError::BadRequest(format!("invalid hub.mode '{other}'"))),
        None => Err(ApiError::BadRequest("missing hub.mode".to_string())),
    }
}
