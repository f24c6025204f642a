use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tax_audit_rust::api::{handlers, AppState};
use tax_audit_rust::models::DocumentStore;
use tax_audit_rust::service::{BatchCoordinator, GeminiTransport};
use tax_audit_rust::{AppConfig, ExtractionClient};
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 使用本地时间格式
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::from_env();
    info!("Starting server on {}:{}", config.server.host, config.server.port);

    // 组装服务: 文档库 + 视觉识别客户端 + 批处理协调器
    let store = Arc::new(DocumentStore::new());
    let transport = Arc::new(GeminiTransport::new(
        &config.extraction.api_base,
        &config.extraction.api_key,
    ));
    let client = Arc::new(ExtractionClient::new(transport, config.extraction.clone()));
    let coordinator = BatchCoordinator::new(Arc::clone(&store), client);

    let state = Arc::new(AppState {
        config: config.clone(),
        ledger: RwLock::new(Vec::new()),
        store,
        coordinator,
        last_batch: RwLock::new(None),
    });

    // 构建路由
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/ledger/import", post(handlers::import_ledger))
        .route("/api/ledger/review", post(handlers::set_reviewed))
        .route("/api/documents/upload", post(handlers::upload_document))
        .route("/api/documents/process", post(handlers::process_documents))
        .route("/api/documents/edit", post(handlers::edit_invoice))
        .route("/api/audit/reconcile", post(handlers::reconcile))
        .route("/api/audit/export", post(handlers::export_report))
        .route("/api/session/save", post(handlers::save_session))
        .route("/api/session/load", post(handlers::load_session))
        .layer(ServiceBuilder::new())
        .with_state(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/ledger/import     - 匯入台帳");
    info!("  POST /api/documents/upload  - 上傳票據檔案");
    info!("  POST /api/documents/process - 批量識別");
    info!("  POST /api/audit/reconcile   - 執行稽核");
    info!("  POST /api/audit/export      - 匯出報告 (CSV)");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
