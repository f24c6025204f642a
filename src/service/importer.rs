use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

use crate::error::ImportError;
use crate::models::LedgerRecord;

/// 规范化后的单元格 (台账导入只关心文本与数值)
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn from_data(data: &Data) -> Self {
        match data {
            Data::Empty => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Float(n) => Cell::Number(*n),
            Data::Int(n) => Cell::Number(*n as f64),
            Data::Bool(b) => Cell::Text(if *b { "TRUE" } else { "FALSE" }.to_string()),
            Data::DateTime(dt) => match dt.as_datetime() {
                Some(d) => Cell::Text(d.format("%Y-%m-%d").to_string()),
                None => Cell::Number(dt.as_f64()),
            },
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(e) => Cell::Text(format!("#{:?}", e)),
        }
    }

    /// 展示文本 (整数不带小数点, 供 raw_row 与文本列使用)
    pub fn as_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(_) => false,
        }
    }
}

/// 目标字段 → 候选表头关键词, 越靠前越精确
const VOUCHER_KEYWORDS: &[&str] = &["帳款單號", "账款单号", "憑單號", "凭单号", "單號", "单号"];
const DATE_KEYWORDS: &[&str] = &["發票日期", "发票日期", "日期"];
const INVOICE_NO_KEYWORDS: &[&str] = &["發票號碼", "发票号码", "發票號", "发票号"];
const SELLER_NAME_KEYWORDS: &[&str] = &["廠商名稱", "供應商名稱", "供应商名称", "廠商", "厂商"];
const SELLER_TAX_KEYWORDS: &[&str] = &["廠商統編", "統一編號", "统一编号", "統編", "稅籍編號", "税号"];
const SALES_KEYWORDS: &[&str] = &["未稅金額", "未税金额", "銷售額", "销售额"];
const TAX_KEYWORDS: &[&str] = &["稅額", "税额"];
const TOTAL_KEYWORDS: &[&str] = &["含稅金額", "含税金额", "價稅合計", "价税合计", "總金額", "总金额", "金額", "金额"];

/// 无表头固定版式导出的列映射 (可配置常量)
pub const FALLBACK_VOUCHER_COL: usize = 0;
pub const FALLBACK_DATE_COL: usize = 1;
pub const FALLBACK_INVOICE_NO_COL: usize = 2;
pub const FALLBACK_SELLER_NAME_COL: usize = 3;
pub const FALLBACK_SELLER_TAX_COL: usize = 4;
pub const FALLBACK_SALES_COL: usize = 5;
pub const FALLBACK_TAX_COL: usize = 6;
pub const FALLBACK_TOTAL_COL: usize = 7;

/// 发票号单元格的分隔符: 空格/逗号/顿号/分号/斜杠 (含全角)
const INVOICE_NO_DELIMITERS: &[char] = &[' ', '\t', ',', '，', '、', ';', '；', '/'];

/// 解析出的列下标; None 表示表头里找不到该字段 (读作空)
#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    voucher_id: usize,
    invoice_date: Option<usize>,
    invoice_numbers: Option<usize>,
    seller_name: Option<usize>,
    seller_tax_id: Option<usize>,
    amount_sales: Option<usize>,
    amount_tax: Option<usize>,
    amount_total: Option<usize>,
}

impl ColumnMap {
    fn fallback() -> Self {
        Self {
            voucher_id: FALLBACK_VOUCHER_COL,
            invoice_date: Some(FALLBACK_DATE_COL),
            invoice_numbers: Some(FALLBACK_INVOICE_NO_COL),
            seller_name: Some(FALLBACK_SELLER_NAME_COL),
            seller_tax_id: Some(FALLBACK_SELLER_TAX_COL),
            amount_sales: Some(FALLBACK_SALES_COL),
            amount_tax: Some(FALLBACK_TAX_COL),
            amount_total: Some(FALLBACK_TOTAL_COL),
        }
    }
}

/// 台账导入服务
///
/// 表头关键词探测自适应列顺序; 探测不到时退回固定版式映射。
pub struct LedgerImporter;

impl LedgerImporter {
    /// 读取导出文件的第一个工作表为二维单元格
    pub fn load_first_sheet(path: &Path) -> Result<Vec<Vec<Cell>>, ImportError> {
        let mut workbook =
            open_workbook_auto(path).map_err(|e| ImportError::Unreadable(e.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| ImportError::Unreadable("文件中沒有工作表".to_string()))?
            .map_err(|e| ImportError::Unreadable(e.to_string()))?;

        Ok(range
            .rows()
            .map(|row| row.iter().map(Cell::from_data).collect())
            .collect())
    }

    /// 把原始行解析为台账记录
    ///
    /// 零条记录返回 `ImportError::NoRecords`, 与格式错误区分。
    pub fn import_rows(rows: &[Vec<Cell>]) -> Result<Vec<LedgerRecord>, ImportError> {
        // 1. 自上而下找表头行: 任一单元格含凭单号关键词
        let header = rows.iter().position(|row| {
            row.iter()
                .any(|cell| contains_any_keyword(&cell.as_text(), VOUCHER_KEYWORDS))
        });

        let (columns, data_start) = match header {
            Some(idx) => (resolve_columns(&rows[idx]), idx + 1),
            // 2. 没有表头: 固定版式, 从首行开始
            None => (ColumnMap::fallback(), 0),
        };

        let mut records = Vec::new();
        for row in rows.iter().skip(data_start) {
            let voucher_cell = cell_at(row, columns.voucher_id);
            let voucher_id = voucher_cell.as_text();

            // 空白或又像表头的行 (小计横幅等) 一律跳过
            if voucher_cell.is_blank() || contains_any_keyword(&voucher_id, VOUCHER_KEYWORDS) {
                continue;
            }

            records.push(LedgerRecord {
                voucher_id,
                invoice_date: opt_cell(row, columns.invoice_date).as_text(),
                invoice_numbers: split_invoice_numbers(
                    &opt_cell(row, columns.invoice_numbers).as_text(),
                ),
                seller_name: opt_cell(row, columns.seller_name).as_text(),
                seller_tax_id: opt_cell(row, columns.seller_tax_id).as_text(),
                amount_sales: parse_currency(opt_cell(row, columns.amount_sales)),
                amount_tax: parse_currency(opt_cell(row, columns.amount_tax)),
                amount_total: parse_currency(opt_cell(row, columns.amount_total)),
                raw_row: row.iter().map(Cell::as_text).collect(),
                reviewed_flag: false,
            });
        }

        if records.is_empty() {
            return Err(ImportError::NoRecords);
        }
        Ok(records)
    }
}

/// 在表头行上为每个字段挑最优列 (关键词排名最靠前的那一列)
fn resolve_columns(header: &[Cell]) -> ColumnMap {
    ColumnMap {
        // 表头行本身由凭单号关键词定位, 该列必然存在
        voucher_id: best_column(header, VOUCHER_KEYWORDS).unwrap_or(FALLBACK_VOUCHER_COL),
        invoice_date: best_column(header, DATE_KEYWORDS),
        invoice_numbers: best_column(header, INVOICE_NO_KEYWORDS),
        seller_name: best_column(header, SELLER_NAME_KEYWORDS),
        seller_tax_id: best_column(header, SELLER_TAX_KEYWORDS),
        amount_sales: best_column(header, SALES_KEYWORDS),
        amount_tax: best_column(header, TAX_KEYWORDS),
        amount_total: best_column(header, TOTAL_KEYWORDS),
    }
}

/// 多列命中同一字段时, 取关键词排名最优者; 同排名取靠左的列
fn best_column(header: &[Cell], keywords: &[&str]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None; // (关键词排名, 列下标)
    for (col, cell) in header.iter().enumerate() {
        let text = cell.as_text();
        if let Some(rank) = keywords.iter().position(|kw| text.contains(kw)) {
            if best.map_or(true, |(r, _)| rank < r) {
                best = Some((rank, col));
            }
        }
    }
    best.map(|(_, col)| col)
}

fn contains_any_keyword(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

fn cell_at(row: &[Cell], idx: usize) -> &Cell {
    row.get(idx).unwrap_or(&Cell::Empty)
}

fn opt_cell(row: &[Cell], idx: Option<usize>) -> &Cell {
    idx.map(|i| cell_at(row, i)).unwrap_or(&Cell::Empty)
}

/// 金额容错解析: 数值直通; 文本去千分位后按浮点解析, 失败一律记 0, 绝不报错
fn parse_currency(cell: &Cell) -> i64 {
    match cell {
        Cell::Number(n) => n.round() as i64,
        Cell::Text(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !c.is_whitespace() && *c != ',' && *c != '，')
                .collect();
            cleaned.parse::<f64>().map(|f| f.round() as i64).unwrap_or(0)
        }
        Cell::Empty => 0,
    }
}

/// 发票号单元格拆分, 丢弃空 token
fn split_invoice_numbers(text: &str) -> Vec<String> {
    text.split(INVOICE_NO_DELIMITERS)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
