use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::ledger::LedgerRecord;

/// 单行稽核结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Match,
    Mismatch,
    MissingDocument,
    ExtraDocument,
}

impl AuditStatus {
    /// 报告展示用语
    pub fn display_phrase(&self) -> &'static str {
        match self {
            AuditStatus::Match => "正常",
            AuditStatus::Mismatch => "異常",
            AuditStatus::MissingDocument => "缺少檔案",
            AuditStatus::ExtraDocument => "多餘檔案",
        }
    }
}

/// 差异原因码 (任一触发即 MISMATCH)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffReason {
    Amount,
    TaxId,
    BuyerTaxId,
    TaxIdUnclear,
    CountMismatch,
    NoMatchFound,
}

impl DiffReason {
    /// 报告展示用语
    pub fn display_phrase(&self) -> &'static str {
        match self {
            DiffReason::Amount => "金額不符",
            DiffReason::TaxId => "賣方統編不符",
            DiffReason::BuyerTaxId => "買方統編錯誤",
            DiffReason::TaxIdUnclear => "賣方統編無法辨識",
            DiffReason::CountMismatch => "發票張數不符",
            DiffReason::NoMatchFound => "找不到對應發票",
        }
    }
}

/// 匹配到的识别条目坐标: (文档 id, 条目下标)
///
/// 从匹配那一刻起显式携带, 后续展示聚合不做任何对象身份查找。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedInvoiceRef {
    pub document_id: String,
    pub invoice_index: usize,
}

/// 匹配到的识别条目聚合展示 (多张发票求和)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayExtraction {
    /// 去重后的发票号, 保持匹配顺序
    pub invoice_numbers: Vec<String>,
    pub amount_sales: i64,
    pub amount_tax: i64,
    pub amount_total: i64,
    /// 去重后的卖方统编 (可能含 `?`)
    pub seller_tax_ids: Vec<String>,
    /// 去重后的买方统编
    pub buyer_tax_ids: Vec<String>,
}

/// 一行稽核结果: 一条台账记录一行, 外加每个没被认领的文档一行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    /// 稳定行键 (凭单号或文档 id)
    pub key: String,
    pub ledger_record: Option<LedgerRecord>,
    /// 认领的文档 id, 字典序
    pub matched_documents: Vec<String>,
    pub primary_document: Option<String>,
    /// 匹配到的识别条目坐标
    pub matched_invoices: Vec<MatchedInvoiceRef>,
    pub display_extraction: Option<DisplayExtraction>,
    pub audit_status: AuditStatus,
    pub diff_reasons: BTreeSet<DiffReason>,
}

/// 一次稽核运行的汇总 (报告头与 API 响应共用)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSummary {
    pub project_name: String,
    pub model: String,
    /// 准确率百分比, 分母不含 MISSING_DOCUMENT 行
    pub accuracy_pct: f64,
    pub duration_ms: u64,
    pub row_count: usize,
    pub matched: usize,
    pub mismatched: usize,
    pub missing: usize,
    pub extra: usize,
}

impl AuditSummary {
    pub fn from_rows(project_name: &str, model: &str, duration_ms: u64, rows: &[AuditRow]) -> Self {
        let matched = rows.iter().filter(|r| r.audit_status == AuditStatus::Match).count();
        let mismatched = rows.iter().filter(|r| r.audit_status == AuditStatus::Mismatch).count();
        let missing = rows
            .iter()
            .filter(|r| r.audit_status == AuditStatus::MissingDocument)
            .count();
        let extra = rows
            .iter()
            .filter(|r| r.audit_status == AuditStatus::ExtraDocument)
            .count();

        // 缺档行无从比对, 不进分母
        let comparable = rows.len() - missing;
        let accuracy_pct = if comparable == 0 {
            0.0
        } else {
            matched as f64 * 100.0 / comparable as f64
        };

        Self {
            project_name: project_name.to_string(),
            model: model.to_string(),
            accuracy_pct,
            duration_ms,
            row_count: rows.len(),
            matched,
            mismatched,
            missing,
            extra,
        }
    }
}
