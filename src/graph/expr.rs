//! `${...}` expressions inside attribute values.
//!
//! Attribute values are plain JSON. Strings may embed expressions such as
//! `${null_network.main.id}`, `${count.index}`, `${each.key}` or
//! `${self.public_ip}`. A string consisting of exactly one expression is
//! replaced by the resolved JSON value itself; embedded expressions are
//! spliced in as text.

use serde_json::Value;

use crate::error::ConfigError;

use super::address::{parse_segments, Address, InstanceKey, Segment};
use super::Attributes;

/// A parsed expression body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reference {
    /// Another resource (or all instances of a declaration) plus an attribute path.
    Resource {
        target: Address,
        path: Vec<Segment>,
    },
    /// `count.index` during expansion.
    CountIndex,
    /// `each.key` during expansion.
    EachKey,
    /// `each.value`, optionally followed by a path into it, during expansion.
    EachValue(Vec<Segment>),
    /// `self.<path>` inside provisioners.
    SelfAttr(Vec<Segment>),
}

/// Result of rendering a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered<T> {
    /// The value with every resolvable expression substituted.
    pub value: T,
    /// Expression bodies that could not be resolved.
    pub unresolved: Vec<String>,
}

impl<T> Rendered<T> {
    /// Returns true if every expression was resolved.
    pub fn is_known(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Returns the bodies of all `${...}` expressions in a string, in order.
pub(crate) fn expression_bodies(text: &str) -> Vec<&str> {
    spans(text).into_iter().map(|(_, _, body)| body).collect()
}

/// Byte spans `(start, end, body)` of every expression in a string.
fn spans(text: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut offset = 0;

    while let Some(open) = text[offset..].find("${") {
        let start = offset + open;
        let Some(close) = text[start + 2..].find('}') else {
            break;
        };
        let end = start + 2 + close + 1;
        found.push((start, end, text[start + 2..end - 1].trim()));
        offset = end;
    }

    found
}

/// Collects the bodies of all expressions in a JSON value.
pub(crate) fn collect_bodies(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(expression_bodies(s).into_iter().map(String::from)),
        Value::Array(items) => items.iter().for_each(|v| collect_bodies(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_bodies(v, out)),
        _ => {}
    }
}

/// Parses an expression body.
pub(crate) fn parse_reference(body: &str) -> Result<Reference, ConfigError> {
    match body {
        "count.index" => return Ok(Reference::CountIndex),
        "each.key" => return Ok(Reference::EachKey),
        "each.value" => return Ok(Reference::EachValue(Vec::new())),
        _ => {}
    }

    if let Some(rest) = body.strip_prefix("each.value.") {
        return Ok(Reference::EachValue(parse_segments(rest)?));
    }

    let segments = parse_segments(body)?;
    if let Some(first) = segments.first()
        && first.ident == "self"
        && first.key.is_none()
    {
        if segments.len() < 2 {
            return Err(ConfigError::invalid_address(body, "self needs an attribute"));
        }
        return Ok(Reference::SelfAttr(segments[1..].to_vec()));
    }

    let (target, consumed) = Address::from_segments(body, &segments)?;
    Ok(Reference::Resource {
        target,
        path: segments[consumed..].to_vec(),
    })
}

/// Looks up an attribute path inside an attribute map.
pub(crate) fn lookup(attributes: &Attributes, path: &[Segment]) -> Option<Value> {
    let (first, rest) = path.split_first()?;
    let current = index(attributes.get(&first.ident)?, first.key.as_ref())?;
    lookup_value(current, rest)
}

/// Looks up a path inside a JSON value; an empty path yields the value.
pub(crate) fn lookup_value(value: &Value, path: &[Segment]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        let child = current.get(&segment.ident)?;
        current = index(child, segment.key.as_ref())?;
    }
    Some(current.clone())
}

fn index<'v>(value: &'v Value, key: Option<&InstanceKey>) -> Option<&'v Value> {
    match key {
        None => Some(value),
        Some(InstanceKey::Index(i)) => value.get(usize::try_from(*i).ok()?),
        Some(InstanceKey::Key(k)) => value.get(k),
    }
}

/// Renders a value, resolving expressions through `resolve`.
pub fn render<F>(value: &Value, resolve: &mut F) -> Rendered<Value>
where
    F: FnMut(&str) -> Option<Value>,
{
    let mut unresolved = Vec::new();
    let value = render_value(value, resolve, &mut unresolved);
    Rendered { value, unresolved }
}

/// Renders every value of an attribute map.
pub fn render_attributes<F>(attributes: &Attributes, resolve: &mut F) -> Rendered<Attributes>
where
    F: FnMut(&str) -> Option<Value>,
{
    let mut unresolved = Vec::new();
    let value = attributes
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v, resolve, &mut unresolved)))
        .collect();
    Rendered { value, unresolved }
}

fn render_value<F>(value: &Value, resolve: &mut F, unresolved: &mut Vec<String>) -> Value
where
    F: FnMut(&str) -> Option<Value>,
{
    match value {
        Value::String(s) => render_string(s, resolve, unresolved),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_value(v, resolve, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, resolve, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string<F>(text: &str, resolve: &mut F, unresolved: &mut Vec<String>) -> Value
where
    F: FnMut(&str) -> Option<Value>,
{
    let found = spans(text);
    if found.is_empty() {
        return Value::String(text.to_string());
    }

    // A lone expression keeps the resolved value's JSON type.
    if let [(0, end, body)] = found.as_slice()
        && *end == text.len()
    {
        return resolve(body).unwrap_or_else(|| {
            unresolved.push((*body).to_string());
            Value::String(text.to_string())
        });
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end, body) in found {
        out.push_str(&text[last..start]);
        match resolve(body) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(other) => out.push_str(&other.to_string()),
            None => {
                unresolved.push(body.to_string());
                out.push_str(&text[start..end]);
            }
        }
        last = end;
    }
    out.push_str(&text[last..]);

    Value::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expression_bodies() {
        assert_eq!(
            expression_bodies("http://${null_lb.main.host}:${ null_lb.main.port }/"),
            vec!["null_lb.main.host", "null_lb.main.port"]
        );
        assert!(expression_bodies("no refs ${ here").is_empty());
    }

    #[test]
    fn test_parse_resource_reference() {
        let reference = parse_reference(r#"module.net.null_subnet.private["dev"].cidr"#)
            .expect("valid reference");
        let Reference::Resource { target, path } = reference else {
            panic!("expected resource reference");
        };
        assert_eq!(target.to_string(), r#"module.net.null_subnet.private["dev"]"#);
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].ident, "cidr");
    }

    #[test]
    fn test_parse_special_references() {
        assert_eq!(parse_reference("count.index").ok(), Some(Reference::CountIndex));
        assert_eq!(parse_reference("each.value").ok(), Some(Reference::EachValue(Vec::new())));
        assert!(matches!(
            parse_reference("each.value.region"),
            Ok(Reference::EachValue(path)) if path.len() == 1 && path[0].ident == "region"
        ));
        assert!(matches!(
            parse_reference("self.public_ip"),
            Ok(Reference::SelfAttr(_))
        ));
        assert!(parse_reference("self").is_err());
    }

    #[test]
    fn test_lone_expression_keeps_type() {
        let rendered = render(&json!("${count.index}"), &mut |_| Some(json!(2)));
        assert_eq!(rendered.value, json!(2));
        assert!(rendered.is_known());
    }

    #[test]
    fn test_embedded_and_unresolved() {
        let mut resolve = |body: &str| (body == "a.b.c").then(|| json!("x"));
        let template = json!({"url": "${a.b.c}-${d.e.f}", "n": [1, "${a.b.c}"]});
        let rendered = render(&template, &mut resolve);
        assert_eq!(rendered.value, json!({"url": "x-${d.e.f}", "n": [1, "x"]}));
        assert_eq!(rendered.unresolved, vec!["d.e.f".to_string()]);
    }

    #[test]
    fn test_lookup_nested_path() {
        let mut attrs = Attributes::new();
        attrs.insert("tags".into(), json!({"env": "prod", "ports": [80, 443]}));
        let path = parse_segments("tags.ports[1]").expect("segments");
        assert_eq!(lookup(&attrs, &path), Some(json!(443)));
        let missing = parse_segments("tags.owner").expect("segments");
        assert_eq!(lookup(&attrs, &missing), None);
    }
}
