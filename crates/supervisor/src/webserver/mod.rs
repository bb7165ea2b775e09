//! Operator API.
//!
//! A small HTTP surface over a running [`SystemHandle`]: service statuses and
//! API restarts.
use std::convert::Infallible;
use std::net::SocketAddr;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use warp::http::StatusCode;
use warp::Filter;

use crate::system::{SystemError, SystemHandle};

const PING: &str = "this is the machined API server";

#[derive(Debug, Serialize)]
struct Message {
    message: String,
}

/// The API routes.
pub fn routes(
    system: SystemHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let health = warp::get().and(warp::path("healthz")).map(|| PING);

    let list_system = system.clone();
    let services = warp::get()
        .and(warp::path!("services"))
        .map(move || warp::reply::json(&list_system.statuses()));

    let restart = warp::post()
        .and(warp::path!("services" / String / "restart"))
        .and_then(move |id| post_restart(system.clone(), id));

    health.or(services).or(restart)
}

/// Serves the API on `addr` until `token` is cancelled. Returns the bound
/// address and the server future.
pub fn start(
    system: SystemHandle,
    addr: SocketAddr,
    token: CancellationToken,
) -> anyhow::Result<(SocketAddr, impl std::future::Future<Output = ()>)> {
    let (bound, server) = warp::serve(routes(system))
        .try_bind_with_graceful_shutdown(addr, async move { token.cancelled().await })?;
    info!(addr = %bound, "API server listening");
    Ok((bound, server))
}

/// Restarts a service.
///
/// Implements the path /services/{id}/restart
#[instrument(level = "info", skip(system))]
async fn post_restart(
    system: SystemHandle,
    id: String,
) -> Result<warp::reply::WithStatus<warp::reply::Json>, Infallible> {
    debug!("Got restart request");
    let (code, message) = match system.restart(&id) {
        Ok(()) => (StatusCode::ACCEPTED, format!("restart of {} requested", id)),
        Err(e @ SystemError::RestartNotAllowed { .. }) => {
            warn!(error = %e, "Refused restart");
            (StatusCode::FORBIDDEN, e.to_string())
        }
        Err(e @ SystemError::UnknownService { .. }) => (StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&Message { message }),
        code,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::service::{ServiceState, ServiceStatus};
    use crate::system::test::{system, wait_for_state, FakeService};
    use std::sync::Arc;

    async fn handle() -> (tempfile::TempDir, SystemHandle) {
        let (dir, mut system) = system();
        let mut kubelet = FakeService::new("kubelet");
        kubelet.restartable = true;
        system.register(Arc::new(FakeService::new("cri"))).unwrap();
        system.register(Arc::new(kubelet)).unwrap();
        let handle = system.start().unwrap();
        wait_for_state(&handle, "kubelet", ServiceState::Running).await;
        (dir, handle)
    }

    #[tokio::test]
    async fn healthz() {
        let (_dir, handle) = handle().await;
        let response = warp::test::request()
            .path("/healthz")
            .reply(&routes(handle.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), PING);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn lists_services_in_start_order() {
        let (_dir, handle) = handle().await;
        let response = warp::test::request()
            .path("/services")
            .reply(&routes(handle.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let statuses: Vec<ServiceStatus> = serde_json::from_slice(response.body()).unwrap();
        let ids: Vec<&str> = statuses.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["cri", "kubelet"]);
        assert!(statuses[1].api_restart_allowed);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn restart_status_codes() {
        let (_dir, handle) = handle().await;
        let routes = routes(handle.clone());
        let status = |path: &'static str| {
            let routes = routes.clone();
            async move {
                warp::test::request()
                    .method("POST")
                    .path(path)
                    .reply(&routes)
                    .await
                    .status()
            }
        };
        assert_eq!(status("/services/kubelet/restart").await, StatusCode::ACCEPTED);
        assert_eq!(status("/services/cri/restart").await, StatusCode::FORBIDDEN);
        assert_eq!(status("/services/etcd/restart").await, StatusCode::NOT_FOUND);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn serves_until_cancelled() {
        let (_dir, handle) = handle().await;
        let token = CancellationToken::new();
        let (addr, server) = start(handle.clone(), ([127, 0, 0, 1], 0).into(), token.clone()).unwrap();
        let server = tokio::spawn(server);

        let body = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, PING);

        token.cancel();
        server.await.unwrap();
        handle.shutdown().await;
    }
}
