use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use listing_chat::gateway::http::HttpGatewayFactory;
use listing_chat::gateway::GatewayFactory;
use listing_chat::openapi::ApiDoc;
use listing_chat::{routes_config, AppState, ChangeFeed, FeedHub, PresenceHub, ServiceConfig, SessionManager};

static METRICS: OnceCell<PrometheusHandle> = OnceCell::new();

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env automatically only in debug builds
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    let config = match ServiceConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Set JWT_SECRET (and optionally CHAT_BACKEND_URL) in the environment or a .env file");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping listing chat server");

    if config.metrics {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS.set(handle);
            }
            Err(e) => warn!("metrics recorder not installed: {e}"),
        }
    }

    let hub = FeedHub::new(config.chat.feed_capacity);
    let factory: Arc<dyn GatewayFactory> = match &config.backend_url {
        Some(url) => {
            info!("Using HTTP backend at {url}");
            if config.change_secret.is_none() {
                warn!("CHAT_CHANGE_SECRET unset: /api/v1/changes will reject every change");
            }
            Arc::new(HttpGatewayFactory::new(url.clone()))
        }
        None => in_memory_backend(&hub),
    };
    let feed: Arc<dyn ChangeFeed> = Arc::new(hub.clone());
    let sessions = Arc::new(SessionManager::new(
        factory,
        feed,
        Arc::new(PresenceHub::default()),
        config.chat.clone(),
    ));
    let state = AppState {
        sessions,
        hub,
        change_secret: config.change_secret.clone(),
        metrics: METRICS.get().cloned(),
    };

    let openapi = ApiDoc::openapi();
    let frontend = config.frontend_url.clone();

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allowed_origin(&frontend)
            .allow_any_header()
            .allowed_methods(["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(routes_config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind((config.bind_addr.as_str(), config.port))?;

    info!("Listening on http://{}:{}", config.bind_addr, config.port);

    server.run().await
}

#[cfg(feature = "inmem-backend")]
fn in_memory_backend(hub: &FeedHub) -> Arc<dyn GatewayFactory> {
    info!("Using in-memory backend");
    Arc::new(listing_chat::gateway::inmem::InMemBackend::new(hub.clone()))
}

#[cfg(not(feature = "inmem-backend"))]
fn in_memory_backend(_hub: &FeedHub) -> Arc<dyn GatewayFactory> {
    eprintln!("CHAT_BACKEND_URL must be set when built without the inmem-backend feature");
    std::process::exit(1);
}
