use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tree_rag::{
    api,
    app_state::AppState,
    catalog::DocumentCatalog,
    config::AppConfig,
    llm::{LlmManager, Reasoner, RetryPolicy},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Abrir el catálogo de documentos
    let catalog = DocumentCatalog::open(cfg.catalog_path.clone()).context("Error abriendo el catálogo")?;
    info!(
        "Catálogo {} cargado con {} documentos",
        catalog.path().display(),
        catalog.len()
    );

    // 4. Inicializar gestor de LLMs
    let llm_manager = LlmManager::from_config(&cfg).context("Error inicializando LLM Manager")?;
    let reasoner = Reasoner::new(Arc::new(llm_manager), RetryPolicy::from_config(&cfg));

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState::new(cfg.clone(), catalog, reasoner, Some(shutdown_tx));

    // 6. Configurar el router de la API
    let app = Router::new().merge(api::create_router(app_state)).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .context("Error en el servidor HTTP")?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
