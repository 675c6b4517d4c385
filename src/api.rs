//! Instance status API.
//!
//! `GET /lrps/{guid}` lists the instances of one process with their state
//! translated into the controller's vocabulary. Every route sits behind the
//! admission gate.

use crate::feed::now_nanos;
use crate::prelude::*;
use crate::receptor::{ActualLrp, LrpReader};
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::get,
    Json, Router,
};
use coord::{admission::admit, AdmissionGate, Ready, Runner};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Starting,
    Running,
    Crashed,
    Unknown,
}

impl InstanceState {
    pub fn from_lrp_state(state: &str) -> Self {
        match state {
            "UNCLAIMED" | "CLAIMED" => InstanceState::Starting,
            "RUNNING" => InstanceState::Running,
            "CRASHED" => InstanceState::Crashed,
            _ => InstanceState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LrpInstance {
    pub process_guid: String,
    pub instance_guid: String,
    pub index: i32,
    pub state: InstanceState,
    pub since_in_ns: i64,
    /// Whole seconds since `since_in_ns` while running, otherwise 0.
    pub uptime: i64,
}

impl LrpInstance {
    pub fn from_actual(lrp: &ActualLrp, now: i64) -> Self {
        let state = InstanceState::from_lrp_state(&lrp.state);
        let uptime = match state {
            InstanceState::Running => now.saturating_sub(lrp.since).max(0) / 1_000_000_000,
            _ => 0,
        };

        Self {
            process_guid: lrp.process_guid.clone(),
            instance_guid: lrp.instance_guid.clone(),
            index: lrp.index,
            state,
            since_in_ns: lrp.since,
            uptime,
        }
    }
}

#[derive(Debug, Clone)]
struct AppState {
    lrps: Arc<dyn LrpReader>,
}

pub fn router(lrps: Arc<dyn LrpReader>, gate: AdmissionGate) -> Router {
    Router::new()
        .route("/lrps/{guid}", get(lrp_status))
        .with_state(AppState { lrps })
        .layer(middleware::from_fn_with_state(gate, admit))
        .layer(TraceLayer::new_for_http())
}

async fn lrp_status(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<Vec<LrpInstance>>, StatusCode> {
    let lrps = state.lrps.actual_lrps_by_process_guid(&guid).await.map_err(|e| {
        error!(process_guid = %guid, error = %format!("{e:#}"), "api.lrp-status.failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let now = now_nanos();
    Ok(Json(lrps.iter().map(|lrp| LrpInstance::from_actual(lrp, now)).collect()))
}

/// Serves [`router`] until shutdown. Ready once the socket is bound.
#[derive(Debug)]
pub struct ApiServer {
    listen_addr: String,
    router: Router,
}

impl ApiServer {
    pub fn new(listen_addr: impl Into<String>, router: Router) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            router,
        }
    }
}

#[async_trait]
impl Runner for ApiServer {
    async fn run(&mut self, shutdown: CancellationToken, mut ready: Ready) -> coord::Result<()> {
        let listener = TcpListener::bind(self.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "api.listening");
        ready.signal();

        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("api.stopped");
        Ok(())
    }
}
