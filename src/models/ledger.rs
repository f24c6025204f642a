use serde::{Deserialize, Serialize};

/// 台账记录 (ERP 导出的一行应付凭单)
///
/// 一行台账可能对应多张实体发票, 因此发票号是列表。
/// 金额统一用整数货币单位 (元), 导入时已做容错解析。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// 凭单号, 主匹配键 (与上传文件名对应)
    pub voucher_id: String,
    pub invoice_date: String,
    /// 该行引用的发票号列表 (保持单元格内出现顺序)
    pub invoice_numbers: Vec<String>,
    pub seller_name: String,
    pub seller_tax_id: String,
    pub amount_sales: i64,
    pub amount_tax: i64,
    pub amount_total: i64,
    /// 原始行单元格, 留作稽核追溯
    pub raw_row: Vec<String>,
    /// 人工复核标记 (不参与匹配)
    #[serde(default)]
    pub reviewed_flag: bool,
}
