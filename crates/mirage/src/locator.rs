//! Locate a JSON payload inside a rendered document by signature key.
//!
//! Pages embed their server-rendered state in inline `<script>` blocks whose
//! nesting changes over time, so the payload is found by searching for the
//! first mapping that carries a known key rather than by a fixed path.

use scraper::{Html, Selector};
use serde_json::Value;

/// Search every inline script block of `html` for a mapping containing `key`.
///
/// Blocks are visited in document order and each block depth-first in
/// source order, so the first match in the document wins. Blocks that are
/// not valid JSON are skipped.
pub fn locate_in_html(html: &str, key: &str) -> Option<Value> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("script") else {
        return None;
    };

    let blocks: Vec<Value> = document
        .select(&selector)
        .filter_map(|element| {
            let text = element.inner_html();
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            serde_json::from_str::<Value>(text).ok()
        })
        .collect();

    search(blocks, key)
}

/// Search a single parsed value for a mapping containing `key`.
pub fn locate_in_value(value: Value, key: &str) -> Option<Value> {
    search(vec![value], key)
}

fn search(seeds: Vec<Value>, key: &str) -> Option<Value> {
    // Reversed pushes keep the stack popping in source order.
    let mut worklist: Vec<Value> = seeds.into_iter().rev().collect();

    while let Some(node) = worklist.pop() {
        match node {
            Value::Array(items) => worklist.extend(items.into_iter().rev()),
            Value::Object(map) => {
                if map.contains_key(key) {
                    return Some(Value::Object(map));
                }
                let children: Vec<Value> = map.into_iter().map(|(_, v)| v).collect();
                worklist.extend(children.into_iter().rev());
            }
            Value::String(text) => {
                if let Some(inner) = reparse(&text) {
                    worklist.push(inner);
                }
            }
            _ => {}
        }
    }
    None
}

/// Double-encoded JSON: a string holding a serialized container.
fn reparse(text: &str) -> Option<Value> {
    let trimmed = text.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finds_nested_mapping() {
        let html = r#"<html><head>
            <script>not json at all</script>
            <script type="application/json">{"require":[["x",{"data":{"user":{"biography_with_entities":{},"username":"a"}}}]]}</script>
        </head></html>"#;
        let found = locate_in_html(html, "biography_with_entities").unwrap();
        assert_eq!(found["username"], "a");
    }

    #[test]
    fn test_finds_inside_string_encoded_json() {
        let inner = json!({"deep": [{"target": 1, "id": "inner"}]}).to_string();
        let outer = json!({"a": {"b": [ {"payload": inner} ]}});
        let found = locate_in_value(outer, "target").unwrap();
        assert_eq!(found["id"], "inner");
    }

    #[test]
    fn test_first_match_in_document_order() {
        let html = r#"
            <script type="application/json">{"other": true}</script>
            <script type="application/json">{"items": [{"sig": 1, "n": "first"}, {"sig": 2, "n": "second"}]}</script>
            <script type="application/json">{"sig": 3, "n": "third"}</script>
        "#;
        let found = locate_in_html(html, "sig").unwrap();
        assert_eq!(found["n"], "first");
    }

    #[test]
    fn test_outer_mapping_wins_over_nested() {
        let value = json!({"sig": 1, "child": {"sig": 2}});
        assert_eq!(locate_in_value(value, "sig").unwrap()["sig"], 1);
    }

    #[test]
    fn test_not_found() {
        let html = r#"<script type="application/json">{"a": [1, "two", {"b": "{broken"}]}</script>"#;
        assert!(locate_in_html(html, "missing").is_none());
        assert!(locate_in_html("", "missing").is_none());
        assert!(locate_in_value(json!("plain"), "missing").is_none());
    }

    #[test]
    fn test_string_seed_is_reparsed() {
        let seed = Value::String(r#"[{"sig": "x"}]"#.to_string());
        assert_eq!(locate_in_value(seed, "sig").unwrap()["sig"], "x");
    }
}
