//! 端到端稽核流程: 匯入台帳 → 批量識別 → 稽核 → 匯出報告

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use tax_audit_rust::config::ExtractionConfig;
use tax_audit_rust::error::ExtractionError;
use tax_audit_rust::models::{
    AuditStatus, AuditSummary, DiffReason, DocumentStatus, DocumentStore, ModelTier,
    RawExtractedInvoice, Usage,
};
use tax_audit_rust::service::{
    extraction::ESCALATION_MARKER, BatchCoordinator, BatchOptions, Cell, ExtractionClient,
    ExtractionTransport, LedgerImporter, ReconciliationEngine, ReportExporter, TransportResponse,
};
use tax_audit_rust::session::SessionSnapshot;

/// 按文档内容查 fixture 的传输层: 内容字符串 → 原始条目 JSON 数组
struct FixtureTransport {
    fixtures: HashMap<String, serde_json::Value>,
}

impl FixtureTransport {
    fn new(fixtures: &[(&str, serde_json::Value)]) -> Arc<Self> {
        Arc::new(Self {
            fixtures: fixtures
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        })
    }
}

#[async_trait]
impl ExtractionTransport for FixtureTransport {
    async fn request(
        &self,
        document: &[u8],
        _mime_type: &str,
        _model: &str,
        _system_prompt: &str,
    ) -> Result<TransportResponse, ExtractionError> {
        let key = String::from_utf8_lossy(document).to_string();
        let json = self
            .fixtures
            .get(&key)
            .ok_or_else(|| ExtractionError::InvalidResponse(format!("無此 fixture: {}", key)))?;
        let invoices: Vec<RawExtractedInvoice> = serde_json::from_value(json.clone())
            .map_err(|e| ExtractionError::InvalidResponse(e.to_string()))?;
        Ok(TransportResponse {
            invoices,
            usage: Usage {
                prompt_tokens: 100,
                output_tokens: 40,
            },
        })
    }
}

fn test_config() -> ExtractionConfig {
    ExtractionConfig {
        api_base: String::new(),
        api_key: String::new(),
        fast_model: "fast-model".to_string(),
        accurate_model: "accurate-model".to_string(),
        max_attempts: 2,
        backoff_base_ms: 1,
        backoff_jitter_ms: 0,
    }
}

fn fast_options() -> BatchOptions {
    BatchOptions {
        concurrency: 4,
        flush_interval_ms: 10,
        tier: ModelTier::Fast,
        enhance_images: false,
    }
}

fn invoice_json(number: &str, seller_tax_id: &str, sales: i64, tax: i64, total: i64) -> serde_json::Value {
    serde_json::json!({
        "document_type": "STANDARD_INVOICE",
        "invoice_number": number,
        "seller_tax_id": seller_tax_id,
        "amount_sales": sales,
        "amount_tax": tax,
        "amount_total": total,
        "verification": { "ai_confidence": 95, "logic_is_valid": true },
        "error_code": "SUCCESS"
    })
}

fn text_row(cells: &[&str]) -> Vec<Cell> {
    cells.iter().map(|s| Cell::Text(s.to_string())).collect()
}

/// 台帳 fixture: V001 單檔、V002 拆兩檔、V003 缺檔
fn sample_ledger_rows() -> Vec<Vec<Cell>> {
    vec![
        text_row(&["帳款單號", "發票日期", "發票號碼", "廠商名稱", "廠商統編", "銷售額", "稅額", "含稅金額"]),
        text_row(&["V001", "2024-01-05", "AB11111111", "甲廠商", "11111111", "100", "5", "105"]),
        text_row(&["V002", "2024-01-08", "CD22222221、CD22222222", "乙廠商", "22222222", "200", "10", "210"]),
        text_row(&["V003", "2024-01-09", "EF33333333", "丙廠商", "33333333", "300", "15", "315"]),
    ]
}

#[tokio::test]
async fn full_flow_from_import_to_report() {
    let records = LedgerImporter::import_rows(&sample_ledger_rows()).unwrap();
    assert_eq!(records.len(), 3);

    let transport = FixtureTransport::new(&[
        ("doc-v001", serde_json::json!([invoice_json("AB11111111", "11111111", 100, 5, 105)])),
        ("doc-v002-1", serde_json::json!([invoice_json("CD22222221", "22222222", 100, 5, 105)])),
        ("doc-v002-2", serde_json::json!([invoice_json("CD22222222", "22222222", 100, 5, 105)])),
        ("doc-x999", serde_json::json!([invoice_json("ZZ99999999", "99999999", 50, 2, 52)])),
    ]);
    let store = Arc::new(DocumentStore::new());
    store.upload("V001.pdf", "application/pdf", b"doc-v001".to_vec());
    store.upload("V002-1.pdf", "application/pdf", b"doc-v002-1".to_vec());
    store.upload("V002-2.pdf", "application/pdf", b"doc-v002-2".to_vec());
    store.upload("X999.pdf", "application/pdf", b"doc-x999".to_vec());

    let client = Arc::new(ExtractionClient::new(transport, test_config()));
    let coordinator = BatchCoordinator::new(store.clone(), client);
    let summary = coordinator
        .run(store.pending_ids(), fast_options(), Arc::new(HashMap::new()), None)
        .await;
    assert_eq!(summary.succeeded, 4);
    assert!(summary.models_used.contains("fast-model"));

    let engine = ReconciliationEngine::new(None);
    let rows = engine.reconcile(&records, &store.snapshot());

    let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["V001", "V002", "V003", "X999"]);

    assert_eq!(rows[0].audit_status, AuditStatus::Match);
    // 拆檔: 兩檔金額相加後與台帳比對
    assert_eq!(rows[1].audit_status, AuditStatus::Match);
    assert_eq!(rows[1].matched_documents, vec!["V002-1", "V002-2"]);
    let display = rows[1].display_extraction.as_ref().unwrap();
    assert_eq!(display.amount_total, 210);
    assert_eq!(rows[2].audit_status, AuditStatus::MissingDocument);
    assert_eq!(rows[3].audit_status, AuditStatus::ExtraDocument);

    // 摘要: 缺檔不進準確率分母 (2 正常 / 3 可比)
    let audit_summary = AuditSummary::from_rows("整合測試", "fast-model", 1200, &rows);
    assert_eq!(audit_summary.matched, 2);
    assert_eq!(audit_summary.missing, 1);
    assert_eq!(audit_summary.extra, 1);
    assert!((audit_summary.accuracy_pct - 200.0 / 3.0).abs() < 0.01);

    let report = ReportExporter::export(&rows, &audit_summary).unwrap();
    assert!(report.starts_with('\u{feff}'));
    assert!(report.contains("專案名稱,整合測試"));
    assert!(report.contains("V001,正常"));
    assert!(report.contains("V003,缺少檔案"));
    assert!(report.contains("X999,多餘檔案"));
}

#[tokio::test]
async fn mismatch_reasons_flow_into_report() {
    let records = LedgerImporter::import_rows(&vec![
        text_row(&["帳款單號", "發票號碼", "廠商統編", "含稅金額"]),
        text_row(&["V010", "EF33333333", "33333333", "315"]),
    ])
    .unwrap();

    // 金額對不上且統編含 ? 占位
    let transport = FixtureTransport::new(&[(
        "doc-v010",
        serde_json::json!([invoice_json("EF33333333", "3333?333", 500, 25, 525)]),
    )]);
    let store = Arc::new(DocumentStore::new());
    store.upload("V010.pdf", "application/pdf", b"doc-v010".to_vec());

    let client = Arc::new(ExtractionClient::new(transport, test_config()));
    let coordinator = BatchCoordinator::new(store.clone(), client);
    coordinator
        .run(store.pending_ids(), fast_options(), Arc::new(HashMap::new()), None)
        .await;

    let engine = ReconciliationEngine::new(None);
    let rows = engine.reconcile(&records, &store.snapshot());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].audit_status, AuditStatus::Mismatch);
    assert!(rows[0].diff_reasons.contains(&DiffReason::Amount));
    assert!(rows[0].diff_reasons.contains(&DiffReason::TaxIdUnclear));
    assert!(!rows[0].diff_reasons.contains(&DiffReason::TaxId));

    let summary = AuditSummary::from_rows("整合測試", "fast-model", 100, &rows);
    let report = ReportExporter::export(&rows, &summary).unwrap();
    assert!(report.contains("金額不符;賣方統編無法辨識"));
}

#[tokio::test]
async fn hybrid_escalation_marks_trace_and_models() {
    // 快速檔: 勾稽不成立 → 升級; 精確檔: 正常
    struct ModelDrivenTransport;

    #[async_trait]
    impl ExtractionTransport for ModelDrivenTransport {
        async fn request(
            &self,
            _document: &[u8],
            _mime_type: &str,
            model: &str,
            _system_prompt: &str,
        ) -> Result<TransportResponse, ExtractionError> {
            let json = if model == "fast-model" {
                serde_json::json!([{
                    "document_type": "STANDARD_INVOICE",
                    "invoice_number": "GH44444444",
                    "seller_tax_id": "44444444",
                    "amount_sales": 100, "amount_tax": 5, "amount_total": 999,
                    "verification": { "ai_confidence": 40, "logic_is_valid": false },
                    "error_code": "SUCCESS"
                }])
            } else {
                serde_json::json!([invoice_json("GH44444444", "44444444", 100, 5, 105)])
            };
            Ok(TransportResponse {
                invoices: serde_json::from_value(json).unwrap(),
                usage: Usage::default(),
            })
        }
    }

    let store = Arc::new(DocumentStore::new());
    store.upload("V020.pdf", "application/pdf", b"doc-v020".to_vec());
    let client = Arc::new(ExtractionClient::new(Arc::new(ModelDrivenTransport), test_config()));
    let coordinator = BatchCoordinator::new(store.clone(), client);

    let mut options = fast_options();
    options.tier = ModelTier::Hybrid;
    let summary = coordinator
        .run(store.pending_ids(), options, Arc::new(HashMap::new()), None)
        .await;

    assert_eq!(summary.succeeded, 1);
    assert!(summary.models_used.contains("accurate-model"));

    let entry = store.get("V020").unwrap();
    assert_eq!(entry.status, DocumentStatus::Success);
    let invoice = &entry.extracted_invoices[0];
    assert_eq!(invoice.amount_total, 105);
    assert_eq!(invoice.trace_logs.first().map(String::as_str), Some(ESCALATION_MARKER));
}

#[tokio::test]
async fn session_snapshot_preserves_audit_result() {
    let records = LedgerImporter::import_rows(&sample_ledger_rows()).unwrap();

    let transport = FixtureTransport::new(&[(
        "doc-v001",
        serde_json::json!([invoice_json("AB11111111", "11111111", 100, 5, 105)]),
    )]);
    let store = Arc::new(DocumentStore::new());
    store.upload("V001.pdf", "application/pdf", b"doc-v001".to_vec());

    let client = Arc::new(ExtractionClient::new(transport, test_config()));
    let coordinator = BatchCoordinator::new(store.clone(), client);
    coordinator
        .run(store.pending_ids(), fast_options(), Arc::new(HashMap::new()), None)
        .await;

    // 保存 → 恢復到全新文檔庫, 稽核結論不變
    let json = SessionSnapshot::capture(&records, &store).to_json().unwrap();
    let snapshot = SessionSnapshot::from_json(&json).unwrap();
    let restored = Arc::new(DocumentStore::new());
    snapshot.restore_documents(&restored);

    let engine = ReconciliationEngine::new(None);
    let before = engine.reconcile(&records, &store.snapshot());
    let after = engine.reconcile(&snapshot.ledger_records, &restored.snapshot());

    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.key, a.key);
        assert_eq!(b.audit_status, a.audit_status);
    }
}

#[tokio::test]
async fn buyer_tax_id_checked_against_company() {
    let records = LedgerImporter::import_rows(&vec![
        text_row(&["帳款單號", "發票號碼", "廠商統編", "含稅金額"]),
        text_row(&["V030", "IJ55555555", "55555555", "105"]),
    ])
    .unwrap();

    let mut wrong_buyer = invoice_json("IJ55555555", "55555555", 100, 5, 105);
    wrong_buyer["buyer_tax_id"] = serde_json::json!("88888888");
    let transport = FixtureTransport::new(&[("doc-v030", serde_json::json!([wrong_buyer]))]);
    let store = Arc::new(DocumentStore::new());
    store.upload("V030.pdf", "application/pdf", b"doc-v030".to_vec());

    let client = Arc::new(ExtractionClient::new(transport, test_config()));
    let coordinator = BatchCoordinator::new(store.clone(), client);
    coordinator
        .run(store.pending_ids(), fast_options(), Arc::new(HashMap::new()), None)
        .await;

    // 本公司統編 99999999, 識別買方 88888888 → 買方統編錯誤
    let engine = ReconciliationEngine::new(Some("99999999".to_string()));
    let rows = engine.reconcile(&records, &store.snapshot());
    assert_eq!(rows[0].audit_status, AuditStatus::Mismatch);
    assert!(rows[0].diff_reasons.contains(&DiffReason::BuyerTaxId));
}
