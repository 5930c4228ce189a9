//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, diagnostics, and metrics
//! of an nsq-link host. It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /status
//! /config
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};

use config::ConnectionConfig;
use nsq_coordination::Readiness;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing::{error, info, trace};

pub use crate::models::{Health, State, Status};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Listens to relevant channels to gather information about
/// the running system and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    cfg: Arc<ConnectionConfig>,
    readiness: Readiness,
}

impl ExternalApi {
    /// Create a new ExternalApi instance. Health starts out `BAD`; `/status`
    /// reports the readiness of the system `readiness` was taken from.
    pub fn new(addr: SocketAddr, cfg: Arc<ConnectionConfig>, readiness: Readiness) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            cfg,
            readiness,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(
        addr: SocketAddr,
        state: State,
        cfg: Arc<ConnectionConfig>,
        readiness: Readiness,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/status", routing::get(handlers::status))
            .route("/config", routing::get(handlers::config))
            .layer(Extension(state))
            .layer(Extension(cfg))
            .layer(Extension(readiness));

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app).await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let cfg = self.cfg.clone();
        let readiness = self.readiness.clone();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, cfg, readiness),
                self.listen_status()
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(),
        }
    }
}

mod handlers {

    use std::sync::Arc;

    use anyhow::Context;
    use axum::{
        Json,
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use config::ConnectionConfig;
    use nsq_coordination::{
        Readiness,
        metrics::{START_TIME, UPTIME},
        resolver,
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use crate::models::{Health, ServerResult, State, Status};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn status(
        Extension(state): Extension<State>,
        Extension(cfg): Extension<Arc<ConnectionConfig>>,
        Extension(readiness): Extension<Readiness>,
    ) -> ServerResult<impl IntoResponse> {
        let addresses = resolver::resolve(&cfg);
        let health = *state.lock();
        Ok(Json(Status {
            health,
            nsq_ready: readiness.is_ready(),
            mode: addresses.mode().to_string(),
            addresses: addresses.addresses().to_vec(),
            topic: cfg.topic().to_owned(),
            channel: cfg.channel().map(ToOwned::to_owned),
        }))
    }

    pub(crate) async fn config(
        Extension(cfg): Extension<Arc<ConnectionConfig>>,
    ) -> ServerResult<impl IntoResponse> {
        // serve the file as loaded rather than re-serializing the validated form
        let path = cfg.path().context("no path specified for config")?;
        let cfg = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to find config at {}", path.display()))?;
        Ok(cfg)
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::response::IntoResponse;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Body of `/status`
    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Eq)]
    pub struct Status {
        /// what `/health` currently reports
        pub health: Health,
        /// every enabled sub-client has reported ready and shutdown has not begun
        pub nsq_ready: bool,
        /// `direct` or `discovery`
        pub mode: String,
        /// nsqd address, or the nsqlookupd addresses
        pub addresses: Vec<String>,
        /// configured topic
        pub topic: String,
        /// configured channel, if any
        pub channel: Option<String>,
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}
