use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExtractionConfig;
use crate::error::ExtractionError;
use crate::models::{
    amounts_consistent, normalize_invoice_number, ExtractedInvoice, ModelTier,
    RawExtractedInvoice, Usage,
};

/// 识别系统提示词: 分类优先级、发票号去空白、统编不许脑补、字段级置信度
pub const SYSTEM_PROMPT: &str = r#"你是发票识别引擎。对图片/PDF 中的每一张票据输出一个 JSON 对象, 整体返回 JSON 数组, 不要输出数组以外的任何内容。
分类优先级 (从高到低): COMMERCIAL_INVOICE (商业发票) > CUSTOMS_DECLARATION (海关缴款书) > STANDARD_INVOICE (统一发票) > NOT_INVOICE (非发票)。
规则:
1. invoice_number 必须去掉所有空白字符。
2. seller_tax_id 中无法辨认的数字一律用 ? 占位, 严禁猜测或编造数字。
3. 金额字段 amount_sales / amount_tax / amount_total 为整数货币单位。
4. 每个字段给出 0-100 的置信度, 放入 field_confidence。
5. verification.logic_is_valid 表示 amount_sales + amount_tax 是否等于 amount_total (容差 1)。
6. error_code 取值: SUCCESS / BLURRY / NOT_INVOICE / PARTIAL / UNKNOWN。
字段: document_type, invoice_number, invoice_date, buyer_tax_id, seller_name, seller_tax_id, amount_sales, amount_tax, amount_total, has_stamp, verification{ai_confidence, logic_is_valid, flagged_fields}, field_confidence, error_code。"#;

/// 混合档升级时写入 trace 的前缀标记
pub const ESCALATION_MARKER: &str = "[升級] 快速檔校驗未通過, 已改用精確檔結果";

/// 幽灵条目金额邻近阈值 (多页扫描伪影, 与原系统一致取固定 5 个货币单位)
const GHOST_TOTAL_TOLERANCE: i64 = 5;

/// 传输层一次调用的返回: 松散条目数组 + token 用量侧信道
#[derive(Debug, Default)]
pub struct TransportResponse {
    pub invoices: Vec<RawExtractedInvoice>,
    pub usage: Usage,
}

/// 识别传输层抽象, 测试注入 mock, 生产走 Gemini
#[async_trait]
pub trait ExtractionTransport: Send + Sync {
    async fn request(
        &self,
        document: &[u8],
        mime_type: &str,
        model: &str,
        system_prompt: &str,
    ) -> Result<TransportResponse, ExtractionError>;
}

/// 一次识别的结果 (条目已过后处理)
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub invoices: Vec<ExtractedInvoice>,
    pub usage: Usage,
    /// 实际产出结果的模型 (混合档升级后为精确档)
    pub model_used: String,
}

/// 混合档两步状态机: 至多升级一次, 由构造保证不会递归
enum EscalationStep {
    AttemptFast,
    AttemptAccurate,
}

/// 识别客户端: 调用 + 重试 + 业务后处理 + 升级策略
pub struct ExtractionClient {
    transport: Arc<dyn ExtractionTransport>,
    config: ExtractionConfig,
    /// 静态参考表: 卖方名称 → 统编 (会话表优先于它)
    static_sellers: HashMap<String, String>,
}

impl ExtractionClient {
    pub fn new(transport: Arc<dyn ExtractionTransport>, config: ExtractionConfig) -> Self {
        Self {
            transport,
            config,
            static_sellers: HashMap::new(),
        }
    }

    pub fn with_static_sellers(mut self, sellers: HashMap<String, String>) -> Self {
        self.static_sellers = sellers;
        self
    }

    /// 识别一个文档, 返回后处理过的发票条目
    ///
    /// `session_sellers` 为会话期学到的 卖方名称→统编 映射, 优先于静态表。
    pub async fn extract(
        &self,
        document: &[u8],
        mime_type: &str,
        tier: ModelTier,
        session_sellers: &HashMap<String, String>,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        match tier {
            ModelTier::Fast => {
                self.attempt(document, mime_type, &self.config.fast_model, session_sellers)
                    .await
            }
            ModelTier::Accurate => {
                self.attempt(document, mime_type, &self.config.accurate_model, session_sellers)
                    .await
            }
            ModelTier::Hybrid => {
                let mut step = EscalationStep::AttemptFast;
                loop {
                    match step {
                        EscalationStep::AttemptFast => {
                            let fast = self
                                .attempt(document, mime_type, &self.config.fast_model, session_sellers)
                                .await?;
                            let all_valid = fast.invoices.iter().all(|i| i.passes_validation());
                            if all_valid {
                                return Ok(fast);
                            }
                            tracing::info!(
                                "快速档校验未通过 ({} 条), 升级精确档 {}",
                                fast.invoices.len(),
                                self.config.accurate_model
                            );
                            step = EscalationStep::AttemptAccurate;
                        }
                        EscalationStep::AttemptAccurate => {
                            let mut accurate = self
                                .attempt(
                                    document,
                                    mime_type,
                                    &self.config.accurate_model,
                                    session_sellers,
                                )
                                .await?;
                            for inv in &mut accurate.invoices {
                                inv.trace_logs.insert(0, ESCALATION_MARKER.to_string());
                            }
                            return Ok(accurate);
                        }
                    }
                }
            }
        }
    }

    /// 单档位调用: 重试包裹传输层, 然后逐条后处理并剔除幽灵条目
    async fn attempt(
        &self,
        document: &[u8],
        mime_type: &str,
        model: &str,
        session_sellers: &HashMap<String, String>,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        let response = self.call_with_retry(document, mime_type, model).await?;

        let processed: Vec<ExtractedInvoice> = response
            .invoices
            .into_iter()
            .map(|raw| self.post_process(raw.repair(), session_sellers))
            .collect();

        Ok(ExtractionOutcome {
            invoices: drop_ghost_entries(processed),
            usage: response.usage,
            model_used: model.to_string(),
        })
    }

    /// 瞬时错误 (429/5xx) 指数退避重试: 基数翻倍 + 随机抖动, 至多 max_attempts 次;
    /// 其它错误立即上抛
    async fn call_with_retry(
        &self,
        document: &[u8],
        mime_type: &str,
        model: &str,
    ) -> Result<TransportResponse, ExtractionError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .transport
                .request(document, mime_type, model, SYSTEM_PROMPT)
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    let backoff = self.config.backoff_base_ms * (1u64 << (attempt - 1));
                    let jitter = if self.config.backoff_jitter_ms == 0 {
                        0
                    } else {
                        rand::thread_rng().gen_range(0..=self.config.backoff_jitter_ms)
                    };
                    tracing::warn!(
                        "识别调用失败 (第 {} 次): {}, {}ms 后重试",
                        attempt,
                        err,
                        backoff + jitter
                    );
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(err) => {
                    // 限流耗尽时带上总尝试次数
                    if err.is_rate_limited() {
                        return Err(ExtractionError::RateLimited { attempts: attempt });
                    }
                    return Err(err);
                }
            }
        }
    }

    /// 业务后处理, 顺序固定, 每步修正追加一条 trace
    fn post_process(
        &self,
        mut inv: ExtractedInvoice,
        session_sellers: &HashMap<String, String>,
    ) -> ExtractedInvoice {
        // 1. 缺失 error_code 已在反序列化修复时默认 SUCCESS

        // 2. 卖方补全: 统编缺失或含 ? 时按名称查合并表 (会话映射覆盖静态表)
        let tax_id_unclear = inv
            .seller_tax_id
            .as_deref()
            .map_or(true, |t| t.contains('?'));
        if tax_id_unclear {
            if let Some(name) = inv.seller_name.as_deref() {
                if let Some(found) = lookup_seller(name, session_sellers, &self.static_sellers) {
                    inv.trace_logs.push(format!(
                        "[自動修正] 賣方統編依名稱查表補全: {} -> {}",
                        name, found
                    ));
                    inv.seller_tax_id = Some(found);
                }
            }
        }

        // 3. 发票号标准化: 去空白转大写
        if let Some(number) = inv.invoice_number.as_deref() {
            let normalized = normalize_invoice_number(number);
            if normalized != number {
                inv.trace_logs
                    .push(format!("[自動修正] 發票號標準化: {} -> {}", number, normalized));
                inv.invoice_number = Some(normalized);
            }
        }

        // 4. 仍含 ? 的统编标旗 (集合插入, 天然幂等)
        if inv
            .seller_tax_id
            .as_deref()
            .is_some_and(|t| t.contains('?'))
        {
            inv.verification
                .flagged_fields
                .insert("seller_tax_id".to_string());
        }

        // 5. 金额勾稽: 先处理 合计<税额 的字段互换错位, 再按 销售额+税额 重算合计
        if inv.amount_total < inv.amount_tax {
            std::mem::swap(&mut inv.amount_total, &mut inv.amount_tax);
            inv.trace_logs.push(format!(
                "[自動修正] 價稅合計與稅額疑似互換, 已交換: 合計={}, 稅額={}",
                inv.amount_total, inv.amount_tax
            ));
        }
        if !amounts_consistent(inv.amount_sales, inv.amount_tax, inv.amount_total) {
            let computed = inv.amount_sales + inv.amount_tax;
            inv.trace_logs.push(format!(
                "[自動修正] 價稅合計重算: {} -> {} (銷售額 {} + 稅額 {})",
                inv.amount_total, computed, inv.amount_sales, inv.amount_tax
            ));
            inv.amount_total = computed;
            // 修正本身即恢复勾稽有效
            inv.verification.logic_is_valid = true;
        }

        inv
    }
}

/// 会话映射优先, 再查静态表; 名称双向子串即视为命中
fn lookup_seller(
    name: &str,
    session: &HashMap<String, String>,
    static_table: &HashMap<String, String>,
) -> Option<String> {
    let probe = |table: &HashMap<String, String>| {
        table
            .iter()
            .find(|(k, _)| name.contains(k.as_str()) || k.contains(name))
            .map(|(_, v)| v.clone())
    };
    probe(session).or_else(|| probe(static_table))
}

/// 剔除幽灵条目: 多页扫描常见的无发票号伪影, 其合计金额与同批
/// 某个有号条目相差不超过 5 个货币单位时丢弃 (保持其余顺序)
fn drop_ghost_entries(invoices: Vec<ExtractedInvoice>) -> Vec<ExtractedInvoice> {
    let numbered_totals: Vec<i64> = invoices
        .iter()
        .filter(|i| i.invoice_number.is_some())
        .map(|i| i.amount_total)
        .collect();

    invoices
        .into_iter()
        .filter(|inv| {
            if inv.invoice_number.is_some() {
                return true;
            }
            let is_ghost = numbered_totals
                .iter()
                .any(|t| (t - inv.amount_total).abs() <= GHOST_TOTAL_TOLERANCE);
            if is_ghost {
                tracing::debug!("丢弃幽灵条目: 无发票号, 合计 {}", inv.amount_total);
            }
            !is_ghost
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Gemini 传输层
// ---------------------------------------------------------------------------

/// 生产传输层: Google Gemini generateContent, 图片/PDF 以 base64 内联
pub struct GeminiTransport {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiInlineData },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    error: Option<GeminiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    message: String,
}

impl GeminiTransport {
    pub fn new(api_base: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl ExtractionTransport for GeminiTransport {
    async fn request(
        &self,
        document: &[u8],
        mime_type: &str,
        model: &str,
        system_prompt: &str,
    ) -> Result<TransportResponse, ExtractionError> {
        use base64::Engine;

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, model, self.api_key
        );

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![
                    GeminiPart::Text {
                        text: system_prompt.to_string(),
                    },
                    GeminiPart::InlineData {
                        inline_data: GeminiInlineData {
                            mime_type: mime_type.to_string(),
                            data: base64::engine::general_purpose::STANDARD.encode(document),
                        },
                    },
                ],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: 0.1,
                response_mime_type: "application/json".to_string(),
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractionError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ExtractionError::RateLimited { attempts: 1 });
        }
        if status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Server {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractionError::InvalidRequest {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::InvalidResponse(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(ExtractionError::InvalidResponse(err.message));
        }

        let text = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or_else(|| ExtractionError::InvalidResponse("模型未返回内容".to_string()))?;

        let invoices: Vec<RawExtractedInvoice> = serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| ExtractionError::InvalidResponse(format!("JSON 数组解析失败: {}", e)))?;

        let usage = parsed
            .usage_metadata
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();

        Ok(TransportResponse { invoices, usage })
    }
}

/// 去掉模型偶尔包裹的 ```json 围栏
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentType, ExtractionCode, Verification};
    use std::sync::Mutex;

    fn test_config() -> ExtractionConfig {
        ExtractionConfig {
            api_base: String::new(),
            api_key: String::new(),
            fast_model: "fast-model".to_string(),
            accurate_model: "accurate-model".to_string(),
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_jitter_ms: 0,
        }
    }

    fn raw(json: &str) -> RawExtractedInvoice {
        serde_json::from_str(json).unwrap()
    }

    /// 脚本化传输层: 按序吐出预设响应并记录用过的模型
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<TransportResponse, ExtractionError>>>,
        models_called: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<TransportResponse, ExtractionError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                models_called: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExtractionTransport for ScriptedTransport {
        async fn request(
            &self,
            _document: &[u8],
            _mime_type: &str,
            model: &str,
            _system_prompt: &str,
        ) -> Result<TransportResponse, ExtractionError> {
            self.models_called.lock().unwrap().push(model.to_string());
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn client_with(
        responses: Vec<Result<TransportResponse, ExtractionError>>,
    ) -> (ExtractionClient, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(responses));
        let client = ExtractionClient::new(transport.clone(), test_config());
        (client, transport)
    }

    #[tokio::test]
    async fn amount_swap_then_recompute() {
        let response = TransportResponse {
            invoices: vec![raw(
                r#"{"invoice_number":"AB12345678","amount_sales":100,"amount_tax":1000,"amount_total":105}"#,
            )],
            usage: Usage::default(),
        };
        let (client, _) = client_with(vec![Ok(response)]);
        let out = client
            .extract(b"img", "image/png", ModelTier::Fast, &HashMap::new())
            .await
            .unwrap();

        let inv = &out.invoices[0];
        // 合计(105) < 税额(1000) 先互换 → 合计=1000 税额=105, 再重算 → 205
        assert_eq!(inv.amount_tax, 105);
        assert_eq!(inv.amount_total, 205);
        assert!(inv.verification.logic_is_valid);
        assert_eq!(inv.trace_logs.len(), 2);
    }

    #[tokio::test]
    async fn unclear_tax_id_is_flagged_not_resolved() {
        let response = TransportResponse {
            invoices: vec![raw(
                r#"{"invoice_number":"AB12345678","seller_tax_id":"12?45678","amount_sales":100,"amount_tax":5,"amount_total":105}"#,
            )],
            usage: Usage::default(),
        };
        let (client, _) = client_with(vec![Ok(response)]);
        let out = client
            .extract(b"img", "image/png", ModelTier::Fast, &HashMap::new())
            .await
            .unwrap();

        let inv = &out.invoices[0];
        assert_eq!(inv.seller_tax_id.as_deref(), Some("12?45678"));
        assert!(inv.verification.flagged_fields.contains("seller_tax_id"));
    }

    #[tokio::test]
    async fn seller_enrichment_prefers_session_map() {
        let response = TransportResponse {
            invoices: vec![raw(
                r#"{"invoice_number":"AB12345678","seller_name":"大安貿易股份有限公司","seller_tax_id":"12?45678","amount_sales":100,"amount_tax":5,"amount_total":105}"#,
            )],
            usage: Usage::default(),
        };
        let (client, _) = client_with(vec![Ok(response)]);
        let client = client.with_static_sellers(HashMap::from([(
            "大安貿易".to_string(),
            "00000000".to_string(),
        )]));
        let session = HashMap::from([("大安貿易".to_string(), "87654321".to_string())]);

        let out = client
            .extract(b"img", "image/png", ModelTier::Fast, &session)
            .await
            .unwrap();
        let inv = &out.invoices[0];
        assert_eq!(inv.seller_tax_id.as_deref(), Some("87654321"));
        // 查表补全后不再含 ?, 不应标旗
        assert!(!inv.verification.flagged_fields.contains("seller_tax_id"));
    }

    #[tokio::test]
    async fn invoice_number_is_normalized_with_trace() {
        let response = TransportResponse {
            invoices: vec![raw(
                r#"{"invoice_number":"ab 1234 5678","amount_sales":100,"amount_tax":5,"amount_total":105}"#,
            )],
            usage: Usage::default(),
        };
        let (client, _) = client_with(vec![Ok(response)]);
        let out = client
            .extract(b"img", "image/png", ModelTier::Fast, &HashMap::new())
            .await
            .unwrap();
        let inv = &out.invoices[0];
        assert_eq!(inv.invoice_number.as_deref(), Some("AB12345678"));
        assert_eq!(inv.trace_logs.len(), 1);
    }

    #[tokio::test]
    async fn ghost_entry_is_dropped() {
        let response = TransportResponse {
            invoices: vec![
                raw(r#"{"invoice_number":"AB12345678","amount_sales":100,"amount_tax":5,"amount_total":105}"#),
                raw(r#"{"amount_sales":102,"amount_tax":5,"amount_total":107}"#),
            ],
            usage: Usage::default(),
        };
        let (client, _) = client_with(vec![Ok(response)]);
        let out = client
            .extract(b"img", "image/png", ModelTier::Fast, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.invoices.len(), 1);
        assert_eq!(out.invoices[0].invoice_number.as_deref(), Some("AB12345678"));
    }

    #[tokio::test]
    async fn hybrid_escalates_once_on_invalid_entry() {
        let fast = TransportResponse {
            // 勾稽成立但缺卖方统编 → 必填字段缺失 → 升级
            invoices: vec![raw(
                r#"{"invoice_number":"AB12345678","amount_sales":100,"amount_tax":5,"amount_total":105,"verification":{"logic_is_valid":true}}"#,
            )],
            usage: Usage::default(),
        };
        let accurate = TransportResponse {
            invoices: vec![raw(
                r#"{"invoice_number":"AB12345678","seller_tax_id":"12345678","amount_sales":100,"amount_tax":5,"amount_total":105,"verification":{"logic_is_valid":true}}"#,
            )],
            usage: Usage::default(),
        };
        let (client, transport) = client_with(vec![Ok(fast), Ok(accurate)]);
        let out = client
            .extract(b"img", "image/png", ModelTier::Hybrid, &HashMap::new())
            .await
            .unwrap();

        assert_eq!(out.model_used, "accurate-model");
        assert_eq!(
            transport.models_called.lock().unwrap().as_slice(),
            ["fast-model", "accurate-model"]
        );
        assert_eq!(out.invoices[0].trace_logs[0], ESCALATION_MARKER);
    }

    #[tokio::test]
    async fn hybrid_does_not_escalate_when_valid() {
        let fast = TransportResponse {
            invoices: vec![raw(
                r#"{"invoice_number":"AB12345678","seller_tax_id":"12345678","amount_sales":100,"amount_tax":5,"amount_total":105,"verification":{"logic_is_valid":true}}"#,
            )],
            usage: Usage::default(),
        };
        let (client, transport) = client_with(vec![Ok(fast)]);
        let out = client
            .extract(b"img", "image/png", ModelTier::Hybrid, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.model_used, "fast-model");
        assert_eq!(transport.models_called.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hybrid_accepts_consistent_amounts_without_verification_block() {
        // 模型没返回 verification 但金额勾稽成立, 不应升级
        let fast = TransportResponse {
            invoices: vec![raw(
                r#"{"invoice_number":"AB12345678","seller_tax_id":"12345678","amount_sales":100,"amount_tax":5,"amount_total":105}"#,
            )],
            usage: Usage::default(),
        };
        let (client, transport) = client_with(vec![Ok(fast)]);
        let out = client
            .extract(b"img", "image/png", ModelTier::Hybrid, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.model_used, "fast-model");
        assert_eq!(transport.models_called.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_then_succeed() {
        let ok = TransportResponse {
            invoices: vec![raw(
                r#"{"invoice_number":"AB12345678","amount_sales":100,"amount_tax":5,"amount_total":105}"#,
            )],
            usage: Usage::default(),
        };
        let (client, transport) = client_with(vec![
            Err(ExtractionError::Server {
                status: 503,
                message: "overloaded".to_string(),
            }),
            Err(ExtractionError::RateLimited { attempts: 1 }),
            Ok(ok),
        ]);
        let out = client
            .extract(b"img", "image/png", ModelTier::Fast, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.invoices.len(), 1);
        assert_eq!(transport.models_called.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_reports_attempts() {
        let (client, _) = client_with(vec![
            Err(ExtractionError::RateLimited { attempts: 1 }),
            Err(ExtractionError::RateLimited { attempts: 1 }),
            Err(ExtractionError::RateLimited { attempts: 1 }),
        ]);
        let err = client
            .extract(b"img", "image/png", ModelTier::Fast, &HashMap::new())
            .await
            .unwrap_err();
        match err {
            ExtractionError::RateLimited { attempts } => assert_eq!(attempts, 3),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (client, transport) = client_with(vec![Err(ExtractionError::InvalidRequest {
            status: 400,
            message: "bad".to_string(),
        })]);
        let err = client
            .extract(b"img", "image/png", ModelTier::Fast, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidRequest { .. }));
        assert_eq!(transport.models_called.lock().unwrap().len(), 1);
    }

    #[test]
    fn code_fence_is_stripped() {
        assert_eq!(strip_code_fence("```json\n[]\n```"), "[]");
        assert_eq!(strip_code_fence("[]"), "[]");
    }

    #[test]
    fn validation_requires_number_and_tax_id() {
        let inv = ExtractedInvoice {
            document_type: DocumentType::StandardInvoice,
            invoice_number: Some("AB12345678".to_string()),
            invoice_date: None,
            buyer_tax_id: None,
            seller_name: None,
            seller_tax_id: None,
            amount_sales: 100,
            amount_tax: 5,
            amount_total: 105,
            has_stamp: false,
            verification: Verification {
                ai_confidence: 90,
                logic_is_valid: true,
                flagged_fields: Default::default(),
            },
            field_confidence: Default::default(),
            error_code: ExtractionCode::Success,
            manually_verified: false,
            trace_logs: Vec::new(),
        };
        assert!(!inv.passes_validation());

        let mut with_tax = inv.clone();
        with_tax.seller_tax_id = Some("12345678".to_string());
        assert!(with_tax.passes_validation());
    }
}
