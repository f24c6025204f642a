use crate::models::{AuditRow, AuditSummary, DiffReason};

/// UTF-8 BOM, 保证 Excel 打开时非 ASCII 内容不乱码
const BOM: &str = "\u{feff}";

/// 报表列头 (固定顺序)
const HEADER: [&str; 10] = [
    "voucher_id",
    "status",
    "ledger_invoice_numbers",
    "extracted_invoice_numbers",
    "buyer_tax_id_status",
    "ledger_seller_tax_id",
    "extracted_seller_tax_id",
    "ledger_total",
    "extracted_total",
    "diff_reasons",
];

/// 稽核报告导出: BOM + 摘要块 + 空行 + 表格体 (纯格式化, 无副作用)
pub struct ReportExporter;

impl ReportExporter {
    pub fn export(rows: &[AuditRow], summary: &AuditSummary) -> Result<String, csv::Error> {
        // 摘要块: key,value 行, 随后空行分隔表格体
        let mut head = String::from(BOM);
        head.push_str(&format!("專案名稱,{}\n", summary.project_name));
        head.push_str(&format!(
            "匯出時間,{}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        head.push_str(&format!("使用模型,{}\n", summary.model));
        head.push_str(&format!("準確率,{:.1}%\n", summary.accuracy_pct));
        head.push_str(&format!("耗時,{:.1} 秒\n", summary.duration_ms as f64 / 1000.0));
        head.push_str(&format!("資料筆數,{}\n", summary.row_count));
        head.push('\n');

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(HEADER)?;
        for row in rows {
            writer.write_record(render_row(row))?;
        }
        writer.flush()?;
        let body = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())?;
        Ok(format!("{}{}", head, body))
    }
}

fn render_row(row: &AuditRow) -> Vec<String> {
    let ledger = row.ledger_record.as_ref();
    let display = row.display_extraction.as_ref();

    let buyer_status = if row.diff_reasons.contains(&DiffReason::BuyerTaxId) {
        "錯誤"
    } else if display.is_none() {
        ""
    } else {
        "正常"
    };

    vec![
        row.key.clone(),
        row.audit_status.display_phrase().to_string(),
        ledger
            .map(|r| r.invoice_numbers.join("、"))
            .unwrap_or_default(),
        display
            .map(|d| d.invoice_numbers.join("、"))
            .unwrap_or_default(),
        buyer_status.to_string(),
        ledger.map(|r| r.seller_tax_id.clone()).unwrap_or_default(),
        display
            .map(|d| d.seller_tax_ids.join("、"))
            .unwrap_or_default(),
        ledger
            .map(|r| r.amount_total.to_string())
            .unwrap_or_default(),
        display
            .map(|d| d.amount_total.to_string())
            .unwrap_or_default(),
        row.diff_reasons
            .iter()
            .map(|r| r.display_phrase())
            .collect::<Vec<_>>()
            .join(";"),
    ]
}
