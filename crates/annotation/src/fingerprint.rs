//! 内容指纹
//!
//! 同一条搜索结果在不同查询、不同引擎下会反复出现，指纹用来识别这些重复内容。
//! 指纹 = sha256(normalize(title) ␟ normalize(snippet) ␟ normalize_url(url))。

use serpline_core::models::{AnnotationItem, Fingerprint};
use sha2::{Digest, Sha256};

/// 字段分隔符 U+241F
const SEPARATOR: &str = "\u{241F}";

/// 小写、去首尾空白、合并连续空白
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 在 `normalize_text` 基础上去掉协议、开头的 `www.` 和结尾的 `/`
pub fn normalize_url(url: &str) -> String {
    let mut url = normalize_text(url);
    if let Some(pos) = url.find("://") {
        url = url[pos + 3..].to_string();
    }
    if let Some(stripped) = url.strip_prefix("www.") {
        url = stripped.to_string();
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

pub fn fingerprint(item: &AnnotationItem) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(&item.title).as_bytes());
    hasher.update(SEPARATOR.as_bytes());
    hasher.update(normalize_text(&item.snippet).as_bytes());
    hasher.update(SEPARATOR.as_bytes());
    hasher.update(normalize_url(&item.url).as_bytes());
    Fingerprint::new(hex::encode(hasher.finalize()))
}
