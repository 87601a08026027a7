//! Atelier server binary: wires the engine together and serves the
//! handoff surface.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

use atelier_kernel::cancel::CancellationRegistry;
use atelier_kernel::config::EngineConfig;
use atelier_kernel::error::{CoreError, CoreResult};
use atelier_kernel::events::EventBus;
use atelier_kernel::llm::DynLlmProvider;
use atelier_kernel::pricing::PricingRegistry;

use atelier_foundation::generator::{
    DynImageGenerator, HttpImageGenerator, ImageBackendConfig, MockImageGenerator,
};
use atelier_foundation::judge::{JudgeEvaluator, TierModels};
use atelier_foundation::llm::{OpenAiConfig, OpenAiProvider};
use atelier_foundation::optimizer::PromptOptimizer;
use atelier_foundation::persistence::InMemoryStore;
use atelier_foundation::rag::RagIndex;
use atelier_foundation::storage::InMemoryObjectStore;

use atelier_runtime::{AppState, InMemoryJobQueue, Orchestrator, OrchestratorContext, WorkerPool};

const WORKER_COUNT: usize = 4;

#[tokio::main]
async fn main() -> CoreResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::from_env();
    info!(bucket = %config.storage_bucket, mock_images = config.mock_images, "starting atelier");

    let provider: DynLlmProvider = Arc::new(
        OpenAiProvider::with_config(
            OpenAiConfig::new(config.api_key.clone()).with_base_url(config.api_base_url.clone()),
        )
        .map_err(CoreError::from)
        .map_err(Report::new)
        .attach_printable("building the LLM provider")?,
    );

    let generator: DynImageGenerator = if config.mock_images {
        Arc::new(MockImageGenerator::new())
    } else {
        let mut backend_config = ImageBackendConfig::new(config.api_key.clone())
            .with_base_url(config.api_base_url.clone())
            .with_model(config.image_model.clone());
        if config.debug_output {
            backend_config = backend_config.with_debug_output(config.debug_dir.clone());
        }
        Arc::new(
            HttpImageGenerator::with_config(backend_config)
                .map_err(CoreError::from)
                .map_err(Report::new)
                .attach_printable("building the image backend")?,
        )
    };

    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(InMemoryObjectStore::new(config.storage_bucket.clone()));
    let rag = Arc::new(RagIndex::new(
        Arc::clone(&provider),
        config.embedding_model.clone(),
    ));
    let evaluator = Arc::new(JudgeEvaluator::new(
        Arc::clone(&provider),
        Arc::clone(&rag),
        TierModels {
            pro: config.model_pro.clone(),
            flash: config.model_flash.clone(),
        },
    ));
    let optimizer = Arc::new(PromptOptimizer::new(
        Arc::clone(&provider),
        store.clone(),
        config.model_pro.clone(),
    ));

    let bus = EventBus::new();
    let cancel = CancellationRegistry::new();
    let queue = Arc::new(InMemoryJobQueue::new());

    let orchestrator = Arc::new(Orchestrator::new(OrchestratorContext {
        store: store.clone(),
        objects: objects.clone(),
        generator,
        evaluator,
        optimizer,
        rag,
        bus: bus.clone(),
        cancel: cancel.clone(),
        pricing: PricingRegistry::with_defaults(),
        config: config.clone(),
    }));

    let workers = WorkerPool::start(
        WORKER_COUNT,
        queue.clone(),
        Arc::clone(&orchestrator),
        store.clone(),
    )
    .await;

    let app = atelier_runtime::router(AppState {
        store: store.clone(),
        queue,
        bus,
        cancel,
        stream_token: config.stream_token.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(CoreError::from)
        .map_err(Report::new)
        .attach_printable_lazy(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "handoff surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(CoreError::from)
        .map_err(Report::new)
        .attach_printable("serving the handoff surface")?;

    workers.stop().await;
    Ok(())
}
