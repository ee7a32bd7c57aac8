//! Field-path grammar for unstructured objects: `a.b`, `a[0]`, `a['k']`.
//! Consumed by readiness checks and connection-detail extraction.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// A parsed, reusable path. Parsing is separated from evaluation so a
/// readiness check or connection-detail selector only pays the parse cost
/// once even though it is evaluated on every reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        let segments = parse_segments(path)?;
        Ok(Self { raw: path.to_string(), segments })
    }

    pub fn get<'a>(&self, value: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match segment {
                Segment::Field(name) => current.get(name)?,
                Segment::Index(i) => current.get(i)?,
            };
        }
        Some(current)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_segments(path: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut field = String::new();

    let flush = |field: &mut String, segments: &mut Vec<Segment>| {
        if !field.is_empty() {
            segments.push(Segment::Field(std::mem::take(field)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut field, &mut segments),
            '[' => {
                flush(&mut field, &mut segments);
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                let inner = inner.trim();
                if let Some(quoted) = inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
                    segments.push(Segment::Field(quoted.to_string()));
                } else if let Some(quoted) = inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                    segments.push(Segment::Field(quoted.to_string()));
                } else {
                    let idx: usize = inner
                        .parse()
                        .map_err(|_| Error::FieldPath(path.to_string(), format!("invalid index `{inner}`")))?;
                    segments.push(Segment::Index(idx));
                }
            }
            other => field.push(other),
        }
    }
    flush(&mut field, &mut segments);

    if segments.is_empty() {
        return Err(Error::FieldPath(path.to_string(), "empty path".to_string()));
    }
    Ok(segments)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_field_access() {
        let v = json!({"status": {"phase": "Ready"}});
        let p = FieldPath::parse("status.phase").unwrap();
        assert_eq!(p.get(&v), Some(&json!("Ready")));
    }

    #[test]
    fn numeric_index_access() {
        let v = json!({"status": {"conditions": [{"type": "Ready"}, {"type": "Synced"}]}});
        let p = FieldPath::parse("status.conditions[1].type").unwrap();
        assert_eq!(p.get(&v), Some(&json!("Synced")));
    }

    #[test]
    fn quoted_key_access() {
        let v = json!({"metadata": {"labels": {"a.b/c": "x"}}});
        let p = FieldPath::parse("metadata.labels['a.b/c']").unwrap();
        assert_eq!(p.get(&v), Some(&json!("x")));
    }

    #[test]
    fn missing_path_returns_none_not_error() {
        let v = json!({"status": {}});
        let p = FieldPath::parse("status.phase").unwrap();
        assert_eq!(p.get(&v), None);
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(FieldPath::parse("").is_err());
    }
}
