use std::sync::Arc;

use wa_dispatch::artifacts::FsArtifactStore;
use wa_dispatch::config::{DispatchConfig, TenantConfig};
use wa_dispatch::delivery::DeliveryNormalizer;
use wa_dispatch::http::{AppState, app_router};
use wa_dispatch::hub::FanoutHub;
use wa_dispatch::hub::ws::ChatState;
use wa_dispatch::job::JobEngine;
use wa_dispatch::store::{LibSqlStore, Store};
use wa_dispatch::transport::{CloudTransport, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; WA_DISPATCH_LOG_DIR switches on daily file logs.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("WA_DISPATCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "wa-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = DispatchConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    let tenant = TenantConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export WA_ACCESS_TOKEN=...");
        eprintln!("  export WA_PHONE_NUMBER_ID=...");
        eprintln!("  export WA_BUSINESS_ACCOUNT_ID=...");
        std::process::exit(1);
    });

    eprintln!("📨 wa-dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Chat WS: ws://0.0.0.0:{}/ws/chat", config.port);
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", config.port);
    eprintln!("   Jobs API: http://0.0.0.0:{}/api/jobs", config.port);
    eprintln!("   Tenant: phone {}", tenant.phone_number_id);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {e}",
                    config.db_path.display()
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Transport, hub, artifacts ────────────────────────────────────────
    let transport: Arc<dyn Transport> = Arc::new(CloudTransport::new(
        tenant,
        config.transport_timeout,
        config.send_max_retries,
    ));
    let hub = Arc::new(FanoutHub::new());
    let artifacts = Arc::new(FsArtifactStore::new(&config.artifact_dir));
    eprintln!("   Reports: {}", config.artifact_dir.display());

    // ── Job engine & delivery normalizer ─────────────────────────────────
    let engine = JobEngine::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        artifacts.clone(),
        config.clone(),
    );
    let normalizer = Arc::new(DeliveryNormalizer::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        Arc::clone(&transport),
        config.artifact_dir.join("media"),
    ));

    // ── HTTP/WS server ───────────────────────────────────────────────────
    let app = app_router(
        AppState {
            store: Arc::clone(&store),
            engine,
            artifacts,
            normalizer,
            transport: Arc::clone(&transport),
            verify_token: config.verify_token.clone(),
        },
        ChatState {
            store,
            hub,
            transport,
        },
    );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "wa-dispatch server started");
    axum::serve(listener, app).await?;

    Ok(())
}
