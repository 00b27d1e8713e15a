//! # 模型与思考强度重定向
//!
//! 精确匹配优先于模糊匹配；渠道映射优先于全局映射。
//! 模糊匹配按 (源长度降序, 源字典序升序) 排序后取第一个
//! "互相包含"的条目，保证最长源优先且结果稳定。

use std::collections::HashMap;

/// 按单个映射表重定向；返回 (结果, 是否命中)
fn redirect_by_mapping(value: &str, mapping: &HashMap<String, String>) -> (String, bool) {
    if mapping.is_empty() || value.is_empty() {
        return (value.to_string(), false);
    }

    // 精确匹配优先
    if let Some(target) = mapping.get(value) {
        return (target.clone(), true);
    }

    // 模糊匹配：源长度降序，等长时字典序升序
    let mut pairs: Vec<(&String, &String)> = mapping
        .iter()
        .filter(|(source, _)| !source.is_empty())
        .collect();
    pairs.sort_by(|a, b| {
        b.0.len()
            .cmp(&a.0.len())
            .then_with(|| a.0.cmp(b.0))
    });

    for (source, target) in pairs {
        if value.contains(source.as_str()) || source.contains(value) {
            return (target.clone(), true);
        }
    }

    (value.to_string(), false)
}

/// 模型重定向：渠道映射优先，全局映射回退。
///
/// 渠道内的模糊命中也优先于全局的精确命中。
#[must_use]
pub fn redirect_model_with_global(
    model: &str,
    channel_mapping: &HashMap<String, String>,
    global_mapping: &HashMap<String, String>,
) -> String {
    let (redirected, matched) = redirect_by_mapping(model, channel_mapping);
    if matched {
        return redirected;
    }
    redirect_by_mapping(model, global_mapping).0
}

/// 思考强度重定向：与模型重定向相同的算法，空输入原样透传
#[must_use]
pub fn redirect_reasoning_effort(
    effort: &str,
    reasoning_mapping: &HashMap<String, String>,
) -> String {
    redirect_by_mapping(effort, reasoning_mapping).0
}

/// 规整映射表：trim 键值、丢弃空条目
#[must_use]
pub fn normalize_mapping(mapping: HashMap<String, String>) -> HashMap<String, String> {
    mapping
        .into_iter()
        .map(|(source, target)| (source.trim().to_string(), target.trim().to_string()))
        .filter(|(source, target)| !source.is_empty() && !target.is_empty())
        .collect()
}

/// 规整思考映射表：额外将键值转为小写
#[must_use]
pub fn normalize_reasoning_mapping(mapping: HashMap<String, String>) -> HashMap<String, String> {
    mapping
        .into_iter()
        .map(|(source, target)| {
            (
                source.trim().to_lowercase(),
                target.trim().to_lowercase(),
            )
        })
        .filter(|(source, target)| !source.is_empty() && !target.is_empty())
        .collect()
}
