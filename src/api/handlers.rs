use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::error::ImportError;
use crate::models::{
    AuditRow, AuditSummary, DocumentStore, ExtractedInvoice, LedgerRecord, ModelTier,
};
use crate::service::{
    BatchCoordinator, BatchOptions, BatchProgress, BatchSummary, Cell, LedgerImporter,
    ReconciliationEngine, ReportExporter,
};
use crate::session::SessionSnapshot;

/// 共享状态: 一次稽核会话 (一批台账 × 一组文档)
pub struct AppState {
    pub config: AppConfig,
    pub ledger: RwLock<Vec<LedgerRecord>>,
    pub store: Arc<DocumentStore>,
    pub coordinator: BatchCoordinator,
    /// 最近一次批处理汇总 (报告摘要里的模型/用量来源)
    pub last_batch: RwLock<Option<BatchSummary>>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                message: message.into(),
            }),
        )
            .into_response()
    }

    fn err(status: StatusCode, message: impl Into<String>) -> Response {
        (
            status,
            Json(Self {
                success: false,
                message: message.into(),
            }),
        )
            .into_response()
    }
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 台账导入请求: 给文件路径或直接给二维单元格
#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub path: Option<String>,
    pub rows: Option<Vec<Vec<String>>>,
}

/// 导入台账 (整批替换, 不做增量合并)
pub async fn import_ledger(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImportRequest>,
) -> Response {
    let rows: Vec<Vec<Cell>> = if let Some(path) = req.path.as_deref() {
        match LedgerImporter::load_first_sheet(Path::new(path)) {
            Ok(rows) => rows,
            Err(e) => return ApiResponse::err(StatusCode::BAD_REQUEST, e.to_string()),
        }
    } else if let Some(rows) = req.rows {
        rows.into_iter()
            .map(|row| row.into_iter().map(Cell::Text).collect())
            .collect()
    } else {
        return ApiResponse::err(StatusCode::BAD_REQUEST, "缺少 path 或 rows");
    };

    match LedgerImporter::import_rows(&rows) {
        Ok(records) => {
            let count = records.len();
            *state.ledger.write().await = records;
            ApiResponse::ok(format!("已匯入 {} 筆台帳記錄", count))
        }
        // 空结果与格式错误分开提示
        Err(ImportError::NoRecords) => {
            ApiResponse::err(StatusCode::UNPROCESSABLE_ENTITY, ImportError::NoRecords.to_string())
        }
        Err(e) => ApiResponse::err(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub voucher_id: String,
    pub reviewed: bool,
}

/// 切换人工复核标记 (不影响匹配)
pub async fn set_reviewed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReviewRequest>,
) -> Response {
    let mut ledger = state.ledger.write().await;
    match ledger.iter_mut().find(|r| r.voucher_id == req.voucher_id) {
        Some(record) => {
            record.reviewed_flag = req.reviewed;
            ApiResponse::ok("已更新複核標記")
        }
        None => ApiResponse::err(StatusCode::NOT_FOUND, "找不到該憑單號"),
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub mime_type: String,
    pub content_base64: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub document_id: String,
}

/// 上传 (或重传) 票据文件
pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadRequest>,
) -> Response {
    let content = match base64::engine::general_purpose::STANDARD.decode(&req.content_base64) {
        Ok(bytes) => bytes,
        Err(e) => {
            return ApiResponse::err(StatusCode::BAD_REQUEST, format!("base64 解碼失敗: {}", e))
        }
    };
    let document_id = state.store.upload(&req.file_name, &req.mime_type, content);
    (
        StatusCode::OK,
        Json(UploadResponse {
            success: true,
            document_id,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub tier: Option<ModelTier>,
}

/// 批量识别所有待处理文档, 返回批处理汇总
pub async fn process_documents(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessRequest>,
) -> Response {
    let pending = state.store.pending_ids();
    if pending.is_empty() {
        return ApiResponse::ok("沒有待處理文檔");
    }

    let options = BatchOptions {
        concurrency: state.config.batch.concurrency,
        flush_interval_ms: state.config.batch.flush_interval_ms,
        tier: req.tier.unwrap_or(ModelTier::Hybrid),
        enhance_images: true,
    };

    // 会话级卖方映射来自台账 (名称 → 统编), 覆盖静态参考表
    let session_sellers = Arc::new(session_sellers_from_ledger(&state.ledger.read().await));

    // 进度快照转结构化日志
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<BatchProgress>();
    let progress_logger = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            tracing::info!(
                "识别进度: {}/{} ({} 条变化)",
                progress.completed,
                progress.total,
                progress.changes.len()
            );
        }
    });

    let summary = state
        .coordinator
        .run(pending, options, session_sellers, Some(tx))
        .await;
    let _ = progress_logger.await;

    *state.last_batch.write().await = Some(summary.clone());
    (StatusCode::OK, Json(summary)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct EditInvoiceRequest {
    pub document_id: String,
    pub invoice_index: usize,
    /// 整条替换, 不做字段级合并
    pub invoice: ExtractedInvoice,
}

/// 人工修正一条识别结果
pub async fn edit_invoice(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EditInvoiceRequest>,
) -> Response {
    if state
        .store
        .replace_invoice(&req.document_id, req.invoice_index, req.invoice)
    {
        ApiResponse::ok("已替換識別結果")
    } else {
        ApiResponse::err(StatusCode::NOT_FOUND, "找不到該文檔或條目下標越界")
    }
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub success: bool,
    pub summary: AuditSummary,
    pub rows: Vec<AuditRow>,
}

/// 执行稽核, 返回全部稽核行与汇总
pub async fn reconcile(State(state): State<Arc<AppState>>) -> Response {
    let (rows, summary) = run_reconciliation(&state).await;
    (
        StatusCode::OK,
        Json(ReconcileResponse {
            success: true,
            summary,
            rows,
        }),
    )
        .into_response()
}

/// 导出稽核报告 (带 BOM 的 CSV)
pub async fn export_report(State(state): State<Arc<AppState>>) -> Response {
    let (rows, summary) = run_reconciliation(&state).await;
    match ReportExporter::export(&rows, &summary) {
        Ok(csv) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            csv,
        )
            .into_response(),
        Err(e) => ApiResponse::err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// 保存会话快照 (JSON 交给外部存储)
pub async fn save_session(State(state): State<Arc<AppState>>) -> Response {
    let ledger = state.ledger.read().await;
    match SessionSnapshot::capture(&ledger, &state.store).to_json() {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(e) => ApiResponse::err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct LoadSessionRequest {
    pub snapshot: String,
}

/// 恢复会话快照 (文档二进制由 blob 存储按 id 另行补齐)
pub async fn load_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoadSessionRequest>,
) -> Response {
    match SessionSnapshot::from_json(&req.snapshot) {
        Ok(snapshot) => {
            *state.ledger.write().await = snapshot.ledger_records.clone();
            snapshot.restore_documents(&state.store);
            ApiResponse::ok(format!(
                "已恢復 {} 筆台帳與 {} 個文檔",
                snapshot.ledger_records.len(),
                snapshot.documents.len()
            ))
        }
        Err(e) => ApiResponse::err(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// 稽核 + 汇总 (稽核总是作用在文档库的点时刻快照上)
async fn run_reconciliation(state: &AppState) -> (Vec<AuditRow>, AuditSummary) {
    let started = Instant::now();
    let ledger = state.ledger.read().await;
    let documents = state.store.snapshot();

    let engine = ReconciliationEngine::new(state.config.audit.company_tax_id.clone());
    let rows = engine.reconcile(&ledger, &documents);

    let model = match state.last_batch.read().await.as_ref() {
        Some(batch) if !batch.models_used.is_empty() => {
            batch.models_used.iter().cloned().collect::<Vec<_>>().join("+")
        }
        _ => "-".to_string(),
    };

    let summary = AuditSummary::from_rows(
        &state.config.audit.project_name,
        &model,
        started.elapsed().as_millis() as u64,
        &rows,
    );
    (rows, summary)
}

fn session_sellers_from_ledger(ledger: &[LedgerRecord]) -> HashMap<String, String> {
    ledger
        .iter()
        .filter(|r| !r.seller_name.trim().is_empty() && !r.seller_tax_id.trim().is_empty())
        .map(|r| (r.seller_name.trim().to_string(), r.seller_tax_id.trim().to_string()))
        .collect()
}
