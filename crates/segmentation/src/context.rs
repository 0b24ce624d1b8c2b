//! Visitor context normalization.
//!
//! Raw request attributes arrive as free-form string pairs. Everything
//! downstream (segment keys, the audit ledger) assumes canonical form,
//! so normalization happens once at the boundary: lowercasing, alias
//! folding, user-agent and referrer reduction, and separator stripping.

use std::collections::HashMap;

use uplift_core::types::VisitorContext;
use url::Url;

/// Longest value kept for any context field.
const MAX_FIELD_LEN: usize = 64;

/// Normalize raw request attributes into a canonical visitor context.
///
/// High-cardinality inputs are reduced rather than carried: the user
/// agent collapses to a `device` class and the referrer to its host.
/// `:` and `|` are reserved as segment key separators and are replaced
/// inside values.
pub fn normalize_context(raw: &HashMap<String, String>) -> VisitorContext {
    let mut context = VisitorContext::default();

    for (raw_key, raw_value) in raw {
        let key = canonical_key(raw_key);
        let value = canonical_value(raw_value);
        if key.is_empty() || value.is_empty() {
            continue;
        }

        match key.as_str() {
            "cluster" | "cluster_id" => {
                context.cluster_id = Some(value);
            }
            "user_agent" | "ua" => {
                // Raw user agents are never stored.
                context
                    .fields
                    .entry("device".to_string())
                    .or_insert_with(|| device_class(&value).to_string());
            }
            "referer" | "referrer" => {
                context
                    .fields
                    .insert("referrer".to_string(), referrer_host(&value));
            }
            _ => {
                context.fields.insert(key, value);
            }
        }
    }

    context
}

fn canonical_key(raw: &str) -> String {
    let key = raw.trim().to_lowercase();
    match key.as_str() {
        "utm_source" => "source".to_string(),
        "utm_medium" => "medium".to_string(),
        "utm_campaign" => "campaign".to_string(),
        _ => key,
    }
}

fn canonical_value(raw: &str) -> String {
    let mut value: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ':' || c == '|' { '-' } else { c })
        .collect();
    if value.len() > MAX_FIELD_LEN {
        // The cap is bytes; back up so the cut lands on a char boundary.
        let mut cut = MAX_FIELD_LEN;
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        value.truncate(cut);
    }
    value
}

fn device_class(user_agent: &str) -> &'static str {
    if user_agent.contains("ipad") || user_agent.contains("tablet") {
        "tablet"
    } else if user_agent.contains("mobi") || user_agent.contains("android") {
        "mobile"
    } else {
        "desktop"
    }
}

/// Reduce a referrer to its host, dropping a leading `www.`. Values
/// that do not parse as URLs are kept as already-canonical strings.
fn referrer_host(value: &str) -> String {
    match Url::parse(value) {
        Ok(url) => match url.host_str() {
            Some(host) => host.trim_start_matches("www.").to_string(),
            None => value.to_string(),
        },
        Err(_) => value.to_string(),
    }
}
