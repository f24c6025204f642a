use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 票据类型, 分类优先级: 商业发票 > 海关缴款书 > 增值税统一发票 > 非发票
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    StandardInvoice,
    CommercialInvoice,
    CustomsDeclaration,
    NotInvoice,
}

/// 单条识别结果的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionCode {
    Success,
    Blurry,
    NotInvoice,
    Partial,
    Unknown,
}

/// 识别模型档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// 快速档 (便宜)
    Fast,
    /// 精确档 (慢)
    Accurate,
    /// 混合档: 先快速档, 校验不过自动升级精确档 (至多一次)
    Hybrid,
}

/// 模型自校验信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Verification {
    /// 整体置信度 0-100
    pub ai_confidence: u8,
    /// 金额勾稽是否成立 (销售额 + 税额 = 价税合计, 容差 ±1)
    pub logic_is_valid: bool,
    /// 需人工关注的字段名集合
    #[serde(default)]
    pub flagged_fields: BTreeSet<String>,
}

/// token 用量侧信道 (仅用于核心之外的成本统计)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub output_tokens: u32,
}

/// 一张实体发票的结构化识别结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedInvoice {
    pub document_type: DocumentType,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<String>,
    pub buyer_tax_id: Option<String>,
    pub seller_name: Option<String>,
    /// 可能含 `?` 占位符 (模型无法辨认的数字, 绝不允许脑补),
    /// 除卖方名称查表补全外永远原样保留
    pub seller_tax_id: Option<String>,
    pub amount_sales: i64,
    pub amount_tax: i64,
    pub amount_total: i64,
    pub has_stamp: bool,
    pub verification: Verification,
    /// 字段级置信度 0-100
    #[serde(default)]
    pub field_confidence: BTreeMap<String, u8>,
    pub error_code: ExtractionCode,
    /// 仅人工复核可置位
    #[serde(default)]
    pub manually_verified: bool,
    /// 每次自动修正追加一条, 保持顺序
    #[serde(default)]
    pub trace_logs: Vec<String>,
}

impl ExtractedInvoice {
    /// 混合档升级判据: 错误码非 SUCCESS、勾稽不成立、或必填字段缺失
    pub fn passes_validation(&self) -> bool {
        if self.error_code != ExtractionCode::Success {
            return false;
        }
        if !self.verification.logic_is_valid {
            return false;
        }
        // 非发票类不要求发票号/统编
        if self.document_type == DocumentType::NotInvoice {
            return true;
        }
        self.invoice_number.as_deref().is_some_and(|s| !s.is_empty())
            && self.seller_tax_id.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// 该条是否应参与台账匹配 (非发票类只做展示兜底)
    pub fn is_matchable(&self) -> bool {
        self.document_type != DocumentType::NotInvoice
            && self.error_code != ExtractionCode::NotInvoice
    }
}

/// 金额勾稽判定: |销售额 + 税额 - 价税合计| <= 1
///
/// 识别后处理与稽核聚合共用同一个判定, 两处不得各写一份。
pub fn amounts_consistent(sales: i64, tax: i64, total: i64) -> bool {
    (sales + tax - total).abs() <= 1
}

/// 发票号标准化 (识别后处理): 去全部空白并转大写, 幂等
pub fn normalize_invoice_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// 发票号匹配键 (稽核/查重): 再去掉连字符, 幂等
pub fn invoice_matching_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_uppercase()
}

/// 模型原始返回条目 (松散 JSON), 在反序列化边界做修复:
/// 缺失字段补安全默认值, 不把 undefined 往管线里传
#[derive(Debug, Default, Deserialize)]
pub struct RawExtractedInvoice {
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<String>,
    #[serde(default)]
    pub buyer_tax_id: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub seller_tax_id: Option<String>,
    #[serde(default)]
    pub amount_sales: Option<f64>,
    #[serde(default)]
    pub amount_tax: Option<f64>,
    #[serde(default)]
    pub amount_total: Option<f64>,
    #[serde(default)]
    pub has_stamp: Option<bool>,
    #[serde(default)]
    pub verification: Option<RawVerification>,
    #[serde(default)]
    pub field_confidence: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawVerification {
    #[serde(default)]
    pub ai_confidence: Option<f64>,
    #[serde(default)]
    pub logic_is_valid: Option<bool>,
    #[serde(default)]
    pub flagged_fields: Option<BTreeSet<String>>,
}

impl RawExtractedInvoice {
    /// 修复为严格结构: 未知票据类型按普通发票处理, 空串视为缺失,
    /// 缺失错误码默认 SUCCESS
    pub fn repair(self) -> ExtractedInvoice {
        let verification = self.verification.unwrap_or_default();
        let amount_sales = to_units(self.amount_sales);
        let amount_tax = to_units(self.amount_tax);
        let amount_total = to_units(self.amount_total);
        ExtractedInvoice {
            document_type: match self.document_type.as_deref() {
                Some("COMMERCIAL_INVOICE") => DocumentType::CommercialInvoice,
                Some("CUSTOMS_DECLARATION") => DocumentType::CustomsDeclaration,
                Some("NOT_INVOICE") => DocumentType::NotInvoice,
                _ => DocumentType::StandardInvoice,
            },
            invoice_number: none_if_blank(self.invoice_number),
            invoice_date: none_if_blank(self.invoice_date),
            buyer_tax_id: none_if_blank(self.buyer_tax_id),
            seller_name: none_if_blank(self.seller_name),
            seller_tax_id: none_if_blank(self.seller_tax_id),
            amount_sales,
            amount_tax,
            amount_total,
            has_stamp: self.has_stamp.unwrap_or(false),
            verification: Verification {
                ai_confidence: clamp_confidence(verification.ai_confidence),
                // 模型没给勾稽结论时按金额自行判定, 勾稽成立不应触发升级
                logic_is_valid: verification
                    .logic_is_valid
                    .unwrap_or_else(|| amounts_consistent(amount_sales, amount_tax, amount_total)),
                flagged_fields: verification.flagged_fields.unwrap_or_default(),
            },
            field_confidence: self
                .field_confidence
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, clamp_confidence(Some(v))))
                .collect(),
            error_code: match self.error_code.as_deref() {
                None | Some("SUCCESS") => ExtractionCode::Success,
                Some("BLURRY") => ExtractionCode::Blurry,
                Some("NOT_INVOICE") => ExtractionCode::NotInvoice,
                Some("PARTIAL") => ExtractionCode::Partial,
                Some(_) => ExtractionCode::Unknown,
            },
            manually_verified: false,
            trace_logs: Vec::new(),
        }
    }
}

fn none_if_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn to_units(v: Option<f64>) -> i64 {
    v.map(|f| f.round() as i64).unwrap_or(0)
}

fn clamp_confidence(v: Option<f64>) -> u8 {
    v.map(|f| f.clamp(0.0, 100.0) as u8).unwrap_or(0)
}
