use indexmap::IndexSet;
use std::collections::{BTreeSet, HashMap};

use crate::models::{
    invoice_matching_key, AuditRow, AuditStatus, DiffReason, DisplayExtraction, DocumentEntry,
    DocumentType, ExtractedInvoice, LedgerRecord, MatchedInvoiceRef,
};

/// 金额比对容差 (聚合合计 vs 台账合计)
const AMOUNT_TOLERANCE: i64 = 1;

/// 稽核引擎: 台账记录 × 文档快照 → 稽核行
///
/// 全程纯函数、永不报错: 每条台账恰好产出一行, 每个没被认领的
/// 文档恰好产出一行 EXTRA_DOCUMENT。对仍在 PROCESSING 的文档,
/// 其识别结果为空, 重跑稽核自然反映最新状态。
pub struct ReconciliationEngine {
    /// 本公司统编 (校验识别出的买方统编; None 则跳过)
    company_tax_id: Option<String>,
}

/// 扁平化后的候选识别条目
struct Candidate<'a> {
    reference: MatchedInvoiceRef,
    invoice: &'a ExtractedInvoice,
    /// 标准化匹配键 (无号则 None)
    number_key: Option<String>,
}

impl ReconciliationEngine {
    pub fn new(company_tax_id: Option<String>) -> Self {
        Self { company_tax_id }
    }

    pub fn reconcile(
        &self,
        ledger_records: &[LedgerRecord],
        documents: &[DocumentEntry],
    ) -> Vec<AuditRow> {
        // 文档认领预分配: 一个文档只归属一条台账;
        // 多条凭单号都能前缀命中时取最长者 (再平手取字典序靠前)
        let claims = assign_claims(ledger_records, documents);
        let docs_by_id: HashMap<&str, &DocumentEntry> =
            documents.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut rows: Vec<AuditRow> = ledger_records
            .iter()
            .map(|record| {
                let matched_ids: Vec<String> = claims
                    .iter()
                    .filter(|(_, voucher)| voucher.as_str() == record.voucher_id)
                    .map(|(doc_id, _)| doc_id.clone())
                    .collect();
                self.audit_one(record, &matched_ids, &docs_by_id)
            })
            .collect();

        // 多余文档行: 没被任何台账认领的文档
        for doc in documents {
            if !claims.contains_key(&doc.id) {
                rows.push(extra_document_row(doc));
            }
        }

        // 字典序排序, 报告与界面稳定可复现
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// 单条台账记录的匹配与判定
    fn audit_one(
        &self,
        record: &LedgerRecord,
        matched_ids: &[String],
        docs_by_id: &HashMap<&str, &DocumentEntry>,
    ) -> AuditRow {
        let mut matched_documents: Vec<String> = matched_ids.to_vec();
        matched_documents.sort();

        // 一个文档都没有 → 缺档, 到此为止
        if matched_documents.is_empty() {
            return AuditRow {
                key: record.voucher_id.clone(),
                ledger_record: Some(record.clone()),
                matched_documents,
                primary_document: None,
                matched_invoices: Vec::new(),
                display_extraction: None,
                audit_status: AuditStatus::MissingDocument,
                diff_reasons: BTreeSet::new(),
            };
        }

        let candidates = flatten_candidates(&matched_documents, docs_by_id);

        // 号码匹配: 双向子串包含 (OCR 可能多/少前导零或前缀)
        let ledger_keys: Vec<String> = record
            .invoice_numbers
            .iter()
            .map(|n| invoice_matching_key(n))
            .filter(|k| !k.is_empty())
            .collect();

        let mut matched: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.invoice.is_matchable())
            .filter(|c| {
                c.number_key
                    .as_deref()
                    .is_some_and(|key| ledger_keys.iter().any(|lk| numbers_match(key, lk)))
            })
            .collect();

        // 单候选兜底: 台账恰一个号, 匹配文档里恰一条有效识别条目
        if matched.is_empty() && record.invoice_numbers.len() == 1 {
            let valid: Vec<&Candidate> = candidates
                .iter()
                .filter(|c| c.invoice.is_matchable())
                .collect();
            if valid.len() == 1 {
                matched = valid;
            }
        }

        let mut diff_reasons: BTreeSet<DiffReason> = BTreeSet::new();

        if matched.is_empty() {
            // 完全匹配不上压倒其余检查
            diff_reasons.insert(DiffReason::NoMatchFound);
            // 展示兜底: 让复核者看到识别出了什么 (含非发票条目)
            let fallback: Vec<&Candidate> = candidates.iter().collect();
            return AuditRow {
                key: record.voucher_id.clone(),
                ledger_record: Some(record.clone()),
                primary_document: matched_documents.first().cloned(),
                matched_documents,
                matched_invoices: Vec::new(),
                display_extraction: Some(aggregate_display(&fallback)),
                audit_status: AuditStatus::Mismatch,
                diff_reasons,
            };
        }

        let display = aggregate_display(&matched);

        // 金额: 聚合合计与台账合计差超容差
        if (display.amount_total - record.amount_total).abs() > AMOUNT_TOLERANCE {
            diff_reasons.insert(DiffReason::Amount);
        }

        let ledger_tax_id = record.seller_tax_id.trim();
        for candidate in &matched {
            let inv = candidate.invoice;
            if let Some(tax_id) = inv.seller_tax_id.as_deref().map(str::trim) {
                if tax_id.is_empty() {
                    continue;
                }
                // 含 ? 的统编只报 "无法辨识", 不参与相等性比对
                if tax_id.contains('?') {
                    diff_reasons.insert(DiffReason::TaxIdUnclear);
                    continue;
                }
                // 商业发票没有本地统编, 不比对
                if inv.document_type != DocumentType::CommercialInvoice && tax_id != ledger_tax_id {
                    diff_reasons.insert(DiffReason::TaxId);
                }
            }
            // 买方统编应为本公司统编
            if let (Some(company), Some(buyer)) =
                (self.company_tax_id.as_deref(), inv.buyer_tax_id.as_deref())
            {
                if !buyer.is_empty() && buyer != company {
                    diff_reasons.insert(DiffReason::BuyerTaxId);
                }
            }
        }

        // 张数: 台账发票号个数 vs 匹配到的识别条目数
        if record.invoice_numbers.len() != matched.len() {
            diff_reasons.insert(DiffReason::CountMismatch);
        }

        let audit_status = if diff_reasons.is_empty() {
            AuditStatus::Match
        } else {
            AuditStatus::Mismatch
        };

        AuditRow {
            key: record.voucher_id.clone(),
            ledger_record: Some(record.clone()),
            primary_document: matched_documents.first().cloned(),
            matched_documents,
            matched_invoices: matched.iter().map(|c| c.reference.clone()).collect(),
            display_extraction: Some(display),
            audit_status,
            diff_reasons,
        }
    }
}

/// 文档 → 认领它的凭单号
///
/// 命中规则: 文档 id 等于凭单号, 或以 `凭单号-` / `凭单号_` 开头
/// (一条台账拆多个扫描文件)。多个凭单号命中取最长。
fn assign_claims(
    ledger_records: &[LedgerRecord],
    documents: &[DocumentEntry],
) -> HashMap<String, String> {
    let mut claims: HashMap<String, String> = HashMap::new();
    for doc in documents {
        let mut best: Option<&str> = None;
        for record in ledger_records {
            let voucher = record.voucher_id.as_str();
            let hit = doc.id == voucher
                || doc.id.starts_with(&format!("{}-", voucher))
                || doc.id.starts_with(&format!("{}_", voucher));
            if hit {
                let better = match best {
                    None => true,
                    Some(b) => {
                        voucher.len() > b.len() || (voucher.len() == b.len() && voucher < b)
                    }
                };
                if better {
                    best = Some(voucher);
                }
            }
        }
        if let Some(voucher) = best {
            claims.insert(doc.id.clone(), voucher.to_string());
        }
    }
    claims
}

/// 展平匹配文档的识别条目并去掉完全重复
/// (同一个非空发票号 + 相同合计金额只算一次), 坐标随条目显式携带
fn flatten_candidates<'a>(
    matched_ids: &[String],
    docs_by_id: &HashMap<&str, &'a DocumentEntry>,
) -> Vec<Candidate<'a>> {
    let mut seen: BTreeSet<(String, i64)> = BTreeSet::new();
    let mut out = Vec::new();
    for doc_id in matched_ids {
        let Some(doc) = docs_by_id.get(doc_id.as_str()) else {
            continue;
        };
        for (idx, inv) in doc.extracted_invoices.iter().enumerate() {
            let number_key = inv
                .invoice_number
                .as_deref()
                .map(invoice_matching_key)
                .filter(|k| !k.is_empty());
            if let Some(key) = &number_key {
                if !seen.insert((key.clone(), inv.amount_total)) {
                    continue; // 跨文件的完全重复条目
                }
            }
            out.push(Candidate {
                reference: MatchedInvoiceRef {
                    document_id: doc_id.clone(),
                    invoice_index: idx,
                },
                invoice: inv,
                number_key,
            });
        }
    }
    out
}

/// 双向子串包含, 对称: matches(a,b) == matches(b,a)
fn numbers_match(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

/// 聚合展示: 金额求和, 发票号/统编保序去重
fn aggregate_display(candidates: &[&Candidate]) -> DisplayExtraction {
    let mut numbers: IndexSet<String> = IndexSet::new();
    let mut seller_tax_ids: IndexSet<String> = IndexSet::new();
    let mut buyer_tax_ids: IndexSet<String> = IndexSet::new();
    let mut display = DisplayExtraction::default();

    for candidate in candidates {
        let inv = candidate.invoice;
        if let Some(n) = inv.invoice_number.as_deref() {
            numbers.insert(n.to_string());
        }
        if let Some(t) = inv.seller_tax_id.as_deref() {
            if !t.is_empty() {
                seller_tax_ids.insert(t.to_string());
            }
        }
        if let Some(t) = inv.buyer_tax_id.as_deref() {
            if !t.is_empty() {
                buyer_tax_ids.insert(t.to_string());
            }
        }
        display.amount_sales += inv.amount_sales;
        display.amount_tax += inv.amount_tax;
        display.amount_total += inv.amount_total;
    }

    display.invoice_numbers = numbers.into_iter().collect();
    display.seller_tax_ids = seller_tax_ids.into_iter().collect();
    display.buyer_tax_ids = buyer_tax_ids.into_iter().collect();
    display
}

/// 没被认领的文档自成一行
fn extra_document_row(doc: &DocumentEntry) -> AuditRow {
    let candidates: Vec<Candidate> =
        flatten_candidates(&[doc.id.clone()], &HashMap::from([(doc.id.as_str(), doc)]));
    let refs: Vec<&Candidate> = candidates.iter().collect();
    AuditRow {
        key: doc.id.clone(),
        ledger_record: None,
        matched_documents: vec![doc.id.clone()],
        primary_document: Some(doc.id.clone()),
        matched_invoices: Vec::new(),
        display_extraction: Some(aggregate_display(&refs)),
        audit_status: AuditStatus::ExtraDocument,
        diff_reasons: BTreeSet::new(),
    }
}
