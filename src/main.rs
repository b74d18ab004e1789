#[macro_use]
extern crate rocket;

mod api;
mod app_state;
mod cell_type;
mod config;
mod cors;
mod detection;
mod engine;
mod error;
mod model_registry;
mod normalizer;
mod types;
mod yolo;

use std::sync::Arc;

use rocket::data::{Limits, ToByteUnit};
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket};
use tracing::{info, warn, Level};

use api::{
    detect, health, internal_error, model_info, not_found, payload_too_large, unprocessable,
};
use app_state::AppState;
use config::Settings;
use cors::Cors;
use model_registry::HubModelLoader;

fn init_tracing(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// 组装 Rocket：配置、共享状态、CORS、生命周期钩子、路由
pub fn build_rocket(state: Arc<AppState>) -> Rocket<Build> {
    let settings = state.settings.clone();
    let upload_limit = settings.max_upload_mib.mebibytes();
    let limits = Limits::default()
        .limit("file", upload_limit)
        .limit("data-form", upload_limit + 1.mebibytes());

    // 日志交给 tracing，Rocket 自己的 logger 关掉
    let figment = rocket::Config::figment()
        .merge(("address", settings.host.clone()))
        .merge(("port", settings.port))
        .merge(("ident", settings.app_name.clone()))
        .merge(("limits", limits))
        .merge(("log_level", "off"));

    rocket::custom(figment)
        .manage(state)
        .attach(Cors::new(settings.cors_origins.clone()))
        .attach(AdHoc::on_liftoff("Model preload", |rocket| {
            Box::pin(async move {
                let Some(state) = rocket.state::<Arc<AppState>>() else {
                    return;
                };
                info!(
                    "App: {} v{}",
                    state.settings.app_name, state.settings.app_version
                );
                info!(
                    "Serving with at most {} concurrent inferences",
                    state.max_concurrent_infer
                );
                if !state.settings.preload_model {
                    return;
                }
                info!("Pre-loading detection model...");
                match state.models.get_handle().await {
                    Ok(_) => info!("Model pre-loaded successfully"),
                    Err(e) => warn!("Model pre-loading failed (will retry on first request): {e}"),
                }
            })
        }))
        .attach(AdHoc::on_shutdown("Model release", |rocket| {
            Box::pin(async move {
                info!("Shutting down CellCount API...");
                if let Some(state) = rocket.state::<Arc<AppState>>() {
                    state.models.release().await;
                }
                info!("Cleanup complete");
            })
        }))
        .mount("/api", routes![health, model_info, detect])
        .mount("/", routes![cors::preflight])
        .register(
            "/",
            catchers![not_found, payload_too_large, unprocessable, internal_error],
        )
}

#[launch]
fn rocket() -> _ {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(settings.debug);
    info!("Starting CellCount API...");

    let loader = Arc::new(HubModelLoader::new(
        settings.model_source(),
        settings.yolo_config(),
        settings.class_names_override(),
    ));
    let state = AppState::new(settings, loader);

    build_rocket(state)
}
