//! WebSocket upgrade endpoint, wiring C8's connection pump to the app's
//! existing C9 collaborators for the immediate post-subscribe snapshot
//! (spec §4.8 step 3, §4.9).

use actix_web::{web, HttpRequest, HttpResponse};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use wirewarden_types::ChannelName;

use crate::app::App;
use crate::hub::pump::{handle_connection, SnapshotSource};
use crate::status::{DockerListProvider, OverviewStatsProvider};

/// Serves `stats` from the overview composite and `docker` from the
/// container list; every other channel has no snapshot (the client just
/// waits for the next broadcast).
struct AppSnapshotSource {
    overview: std::sync::Arc<dyn OverviewStatsProvider>,
    docker: std::sync::Arc<dyn DockerListProvider>,
}

impl SnapshotSource for AppSnapshotSource {
    fn snapshot(&self, channel: ChannelName) -> BoxFuture<'_, Option<Value>> {
        Box::pin(async move {
            match channel {
                ChannelName::Stats => Some(self.overview.overview().await),
                ChannelName::Docker => {
                    let containers = self.docker.list().await;
                    Some(serde_json::to_value(&containers).unwrap_or(Value::Null))
                }
                _ => None,
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws(
    req: HttpRequest,
    body: web::Payload,
    app: web::Data<App>,
    query: web::Query<WsQuery>,
) -> actix_web::Result<HttpResponse> {
    let snapshots = std::sync::Arc::new(AppSnapshotSource {
        overview: app.overview.clone(),
        docker: app.docker.clone(),
    });

    handle_connection(
        req,
        body,
        app.hub.clone(),
        app.identity.clone(),
        snapshots,
        app.docker_logs(),
        query.into_inner().token,
    )
    .await
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/ws").route(web::get().to(ws)));
}
