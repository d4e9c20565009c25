//! Streaming decoder for `---` separated YAML (or JSON) snapshot documents.

use std::collections::VecDeque;
use std::io::BufRead;

use kube::core::DynamicObject;
use serde_json::Value as Json;

fn max_doc_bytes() -> usize {
    std::env::var("STAGEHAND_MAX_DOC_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1 << 20) // 1 MiB default
}

fn max_doc_nodes() -> usize {
    std::env::var("STAGEHAND_MAX_DOC_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("reading input: {0}")]
    Io(#[from] std::io::Error),
    #[error("document {document}: invalid separator line {line:?}")]
    Separator { document: usize, line: String },
    #[error("document {document}: larger than {max} bytes")]
    TooLarge { document: usize, max: usize },
    #[error("document {document}: {source}")]
    Yaml {
        document: usize,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("document {document}: {reason}")]
    Invalid { document: usize, reason: String },
}

/// Splits a stream into raw documents on lines starting with `---`.
///
/// Only whitespace or a `#` comment may follow the separator.
pub struct DocumentReader<R> {
    reader: R,
    index: usize,
    max_bytes: usize,
    done: bool,
}

impl<R: BufRead> DocumentReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, index: 0, max_bytes: max_doc_bytes(), done: false }
    }

    /// Index of the document most recently returned (0-based).
    pub fn index(&self) -> usize {
        self.index.saturating_sub(1)
    }

    /// Next raw document, `None` at end of input.
    pub fn next_document(&mut self) -> Result<Option<String>, DecodeError> {
        if self.done {
            return Ok(None);
        }
        let mut doc = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                self.done = true;
                return Ok(self.finish(doc));
            }
            if let Some(rest) = line.strip_prefix("---") {
                let rest = rest.trim();
                if !rest.is_empty() && !rest.starts_with('#') {
                    self.done = true;
                    return Err(DecodeError::Separator { document: self.index, line: line.trim_end().to_string() });
                }
                if doc.is_empty() {
                    continue;
                }
                return Ok(self.finish(doc));
            }
            doc.push_str(&line);
            if doc.len() > self.max_bytes {
                self.done = true;
                return Err(DecodeError::TooLarge { document: self.index, max: self.max_bytes });
            }
        }
    }

    fn finish(&mut self, doc: String) -> Option<String> {
        if doc.is_empty() {
            return None;
        }
        self.index += 1;
        Some(doc)
    }
}

fn is_blank(doc: &str) -> bool {
    doc.lines().map(str::trim).all(|l| l.is_empty() || l.starts_with('#'))
}

fn to_object(value: Json, document: usize) -> Result<DynamicObject, DecodeError> {
    let invalid = |reason: &str| DecodeError::Invalid { document, reason: reason.to_string() };
    if value.get("apiVersion").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        return Err(invalid("missing apiVersion"));
    }
    if value.get("kind").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        return Err(invalid("missing kind"));
    }
    if value.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        return Err(invalid("missing metadata.name"));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Invalid { document, reason: e.to_string() })
}

/// Parse one raw document into objects. `*List` kinds expand into their items.
pub fn parse_document(doc: &str, document: usize) -> Result<Vec<DynamicObject>, DecodeError> {
    if is_blank(doc) {
        return Ok(Vec::new());
    }
    let mut value: Json = serde_yaml::from_str(doc).map_err(|source| DecodeError::Yaml { document, source })?;
    if value.is_null() {
        return Ok(Vec::new());
    }
    if !value.is_object() {
        return Err(DecodeError::Invalid { document, reason: "document is not an object".into() });
    }
    if json_node_budget_exceeded(&value, max_doc_nodes()) {
        return Err(DecodeError::Invalid { document, reason: format!("too complex (>{} nodes)", max_doc_nodes()) });
    }
    let is_list = value.get("kind").and_then(|k| k.as_str()).is_some_and(|k| k.ends_with("List"));
    if is_list {
        if let Some(items) = value.get_mut("items").and_then(Json::as_array_mut).map(std::mem::take) {
            return items.into_iter().map(|item| to_object(item, document)).collect();
        }
    }
    Ok(vec![to_object(value, document)?])
}

/// Lazily yields objects from a document stream. Stops after the first error.
pub struct Decoder<R> {
    docs: DocumentReader<R>,
    queued: VecDeque<DynamicObject>,
    failed: bool,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self { docs: DocumentReader::new(reader), queued: VecDeque::new(), failed: false }
    }
}

impl<R: BufRead> Iterator for Decoder<R> {
    type Item = Result<DynamicObject, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(obj) = self.queued.pop_front() {
                return Some(Ok(obj));
            }
            if self.failed {
                return None;
            }
            let parsed = match self.docs.next_document() {
                Ok(Some(doc)) => parse_document(&doc, self.docs.index()),
                Ok(None) => return None,
                Err(e) => Err(e),
            };
            match parsed {
                Ok(objs) => self.queued.extend(objs),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{display_name, kind_of};

    fn decode_all(input: &str) -> Result<Vec<DynamicObject>, DecodeError> {
        Decoder::new(input.as_bytes()).collect()
    }

    #[test]
    fn splits_on_separators_and_skips_empty_documents() {
        let input = "\
---
apiVersion: v1
kind: Namespace
metadata:
  name: demo
--- # second
# only a comment
---

apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: demo
data:
  k: v
";
        let objs = decode_all(input).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(kind_of(&objs[0]), "Namespace");
        assert_eq!(display_name(&objs[1]), "demo/settings");
        assert_eq!(objs[1].data["data"]["k"], "v");
    }

    #[test]
    fn list_documents_expand_into_items() {
        let input = r#"{"apiVersion": "v1", "kind": "List", "items": [
            {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "a"}},
            {"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "b"}}
        ]}"#;
        let objs = decode_all(input).unwrap();
        let names: Vec<_> = objs.iter().map(display_name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn junk_after_separator_is_an_error() {
        let input = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: a\n--- kind: Pod\n";
        let mut dec = Decoder::new(input.as_bytes());
        assert!(matches!(dec.next(), Some(Err(DecodeError::Separator { document: 0, .. }))));
        assert!(dec.next().is_none());
    }

    #[test]
    fn malformed_documents_are_reported_with_reason() {
        let e = decode_all("kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e.contains("missing apiVersion"), "e={}", e);
        let e = decode_all("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e.contains("missing kind"), "e={}", e);
        let e = decode_all("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e.contains("missing metadata.name"), "e={}", e);
        assert!(matches!(decode_all("a: [1, 2\n"), Err(DecodeError::Yaml { .. })));
        assert!(matches!(decode_all("- 1\n- 2\n"), Err(DecodeError::Invalid { .. })));
    }

    #[test]
    fn default_document_limit_is_one_mebibyte() {
        if std::env::var_os("STAGEHAND_MAX_DOC_BYTES").is_none() {
            assert_eq!(max_doc_bytes(), 1_048_576);
        }
    }

    #[test]
    fn node_budget_counts_nested_values() {
        let v = serde_json::json!({"a": [1, 2, 3], "b": {"c": true}});
        assert!(!json_node_budget_exceeded(&v, 100));
        assert!(json_node_budget_exceeded(&v, 3));
    }
}
