// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod data_repo;
mod document_store;
mod es_client;
mod extraction;
mod ingest;
mod llm;
mod llm_output;
mod media;
mod models;
mod openai;
mod poll;
mod rag;
mod sanitize;
mod transcribe;
mod video_host;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::data_repo::DataRepo;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Asegurar el repositorio local
    let repo = DataRepo::new(&cfg.data_repo_dir);
    repo.setup().await?;
    info!("Repositorio de datos en {}", repo.root().display());

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 4. Crear estado compartido de la aplicación (clientes, ingesta y chat)
    let app_state = AppState::from_config(cfg, repo, shutdown_tx)?;

    // 5. Asegurar índices
    app_state
        .search
        .ensure_indices()
        .await
        .context("Error asegurando los índices de Elasticsearch")?;

    // 6. Configurar el router de la API
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {server_addr}"))?;
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .context("Error en el servidor")?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
