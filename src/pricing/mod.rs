//! # 费用计算服务
//!
//! 基于模型定价表计算单次请求的 token 费用（美分，四舍五入取整）。
//! 未命中定价的模型费用记 0，不阻塞请求链路。

use crate::metrics::Usage;
use std::collections::HashMap;

/// 单个模型的定价（美元 / 百万 token）
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

/// 定价服务
#[derive(Debug, Clone)]
pub struct PricingService {
    prices: HashMap<String, ModelPrice>,
}

impl Default for PricingService {
    fn default() -> Self {
        Self::with_builtin_table()
    }
}

impl PricingService {
    /// 内置定价表（常见模型族；可由外部定价源覆盖）
    #[must_use]
    pub fn with_builtin_table() -> Self {
        let mut prices = HashMap::new();
        let mut add = |model: &str, input: f64, output: f64, cache_write: f64, cache_read: f64| {
            prices.insert(
                model.to_string(),
                ModelPrice {
                    input,
                    output,
                    cache_write,
                    cache_read,
                },
            );
        };

        add("claude-3-5-haiku", 0.8, 4.0, 1.0, 0.08);
        add("claude-3-7-sonnet", 3.0, 15.0, 3.75, 0.3);
        add("claude-sonnet-4", 3.0, 15.0, 3.75, 0.3);
        add("claude-opus-4", 15.0, 75.0, 18.75, 1.5);
        add("gpt-4o-mini", 0.15, 0.6, 0.0, 0.075);
        add("gpt-4o", 2.5, 10.0, 0.0, 1.25);
        add("gpt-4.1", 2.0, 8.0, 0.0, 0.5);
        add("gpt-5", 1.25, 10.0, 0.0, 0.125);
        add("o3", 2.0, 8.0, 0.0, 0.5);
        add("gemini-2.0-flash", 0.1, 0.4, 0.0, 0.025);
        add("gemini-2.5-flash", 0.3, 2.5, 0.0, 0.075);
        add("gemini-2.5-pro", 1.25, 10.0, 0.0, 0.31);

        Self { prices }
    }

    /// 用外部定价表覆盖
    #[must_use]
    pub fn with_table(prices: HashMap<String, ModelPrice>) -> Self {
        Self { prices }
    }

    /// 查找模型定价：精确匹配优先，其次按最长源匹配（模型名常带
    /// 日期/版本后缀，如 claude-sonnet-4-20250514）
    #[must_use]
    pub fn lookup(&self, model: &str) -> Option<ModelPrice> {
        if model.is_empty() {
            return None;
        }
        if let Some(price) = self.prices.get(model) {
            return Some(*price);
        }
        let mut candidates: Vec<(&String, &ModelPrice)> = self
            .prices
            .iter()
            .filter(|(name, _)| model.contains(name.as_str()))
            .collect();
        candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
        candidates.first().map(|(_, price)| **price)
    }

    /// 计算单次请求费用（美分，四舍五入取整）。未命中定价返回 0。
    #[must_use]
    pub fn cost_cents(&self, model: &str, usage: &Usage) -> i64 {
        let Some(price) = self.lookup(model) else {
            return 0;
        };
        let per_token = |count: i64, usd_per_million: f64| -> f64 {
            count as f64 * usd_per_million / 1_000_000.0
        };
        let usd = per_token(usage.input_tokens, price.input)
            + per_token(usage.output_tokens, price.output)
            + per_token(usage.effective_cache_creation(), price.cache_write)
            + per_token(usage.cache_read_input_tokens, price.cache_read);
        (usd * 100.0).round() as i64
    }
}
