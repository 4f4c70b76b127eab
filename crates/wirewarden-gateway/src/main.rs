// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::Path;

use actix_web::{web, App as ActixApp, HttpResponse, HttpServer};
use tracing::info;

use wirewarden_gateway::app::App;
use wirewarden_gateway::config::Config;
use wirewarden_gateway::{db, middleware, routes};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().expect("failed to load configuration");
    info!(addr = %config.bind_addr, "starting wirewarden-gateway");

    let pool = db::create_pool(&config.database_url).await;
    db::migrate(&pool).await;
    info!("database migrations applied");

    let legacy_path = Path::new(&config.data_dir).join("peers.json");
    let bind = config.bind_addr.clone();

    let app_state = App::build(config, pool).await;

    match app_state.peers.migrate_legacy(&legacy_path).await {
        Ok(0) => {}
        Ok(count) => info!(count, "migrated legacy peers file"),
        Err(err) => tracing::error!(error = %err, "legacy peer migration failed"),
    }

    let app_data = web::Data::new(app_state);

    HttpServer::new(move || {
        ActixApp::new()
            .app_data(app_data.clone())
            .wrap(middleware::RequestLogger)
            .route("/health", web::get().to(health))
            .configure(routes::configure)
    })
    .bind(&bind)?
    .run()
    .await
}
