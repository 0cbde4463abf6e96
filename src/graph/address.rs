//! Resource instance addresses.
//!
//! An address names one concrete instance: an optional chain of module
//! names, the resource type, the declared name and an optional instance key.
//! The canonical text form is `module.net.null_subnet.private["dev"]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Key distinguishing instances expanded from one declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceKey {
    /// Index produced by `count` expansion.
    Index(u64),
    /// Key produced by `for_each` expansion.
    Key(String),
}

/// Unique address of a resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    /// Module path from the root, outermost first.
    pub module: Vec<String>,
    /// Resource type, e.g. `null_instance`.
    pub resource_type: String,
    /// Declared resource name.
    pub name: String,
    /// Instance key, if the declaration was expanded.
    pub key: Option<InstanceKey>,
}

/// One dotted segment of an address or reference, with its optional `[key]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub ident: String,
    pub key: Option<InstanceKey>,
}

impl Address {
    /// Creates a root-module address without a key.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: Vec::new(),
            resource_type: resource_type.into(),
            name: name.into(),
            key: None,
        }
    }

    /// Returns this address placed inside the given module path.
    #[must_use]
    pub fn in_module(mut self, module: &[String]) -> Self {
        self.module = module.to_vec();
        self
    }

    /// Returns this address with the given instance key.
    #[must_use]
    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Returns the address of the declaration this instance was expanded from.
    #[must_use]
    pub fn base(&self) -> Self {
        Self {
            key: None,
            ..self.clone()
        }
    }

    /// Returns true if this address lives in the root module.
    #[must_use]
    pub const fn is_root_module(&self) -> bool {
        self.module.is_empty()
    }

    /// Builds an address from parsed segments, returning the unconsumed tail.
    pub(crate) fn from_segments(
        input: &str,
        segments: &[Segment],
    ) -> Result<(Self, usize), ConfigError> {
        let mut module = Vec::new();
        let mut i = 0;

        while i + 3 < segments.len() && segments[i].ident == "module" && segments[i].key.is_none() {
            let name = &segments[i + 1];
            if name.key.is_some() {
                return Err(ConfigError::invalid_address(
                    input,
                    "module instances cannot be keyed",
                ));
            }
            module.push(name.ident.clone());
            i += 2;
        }

        let (Some(type_segment), Some(name_segment)) = (segments.get(i), segments.get(i + 1))
        else {
            return Err(ConfigError::invalid_address(
                input,
                "expected <type>.<name>",
            ));
        };

        if type_segment.key.is_some() {
            return Err(ConfigError::invalid_address(
                input,
                "resource type cannot carry an instance key",
            ));
        }

        let address = Self {
            module,
            resource_type: type_segment.ident.clone(),
            name: name_segment.ident.clone(),
            key: name_segment.key.clone(),
        };

        Ok((address, i + 2))
    }
}

const fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Returns true if `text` can appear as a module, type or name segment.
pub(crate) fn is_identifier(text: &str) -> bool {
    !text.is_empty() && text.chars().all(is_identifier_char)
}

/// Splits `a.b["k"].c[0]` into segments.
///
/// String keys may contain `\"` and `\\` escapes.
pub(crate) fn parse_segments(input: &str) -> Result<Vec<Segment>, ConfigError> {
    let mut segments = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        let mut ident = String::new();
        while let Some(&c) = chars.peek() {
            if is_identifier_char(c) {
                ident.push(c);
                chars.next();
            } else {
                break;
            }
        }

        if ident.is_empty() {
            return Err(ConfigError::invalid_address(input, "empty segment"));
        }

        let mut key = None;
        if chars.peek() == Some(&'[') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => text.push(c),
                            _ => {
                                return Err(ConfigError::invalid_address(
                                    input,
                                    "invalid escape in string key",
                                ));
                            }
                        },
                        Some(c) => text.push(c),
                        None => {
                            return Err(ConfigError::invalid_address(
                                input,
                                "unterminated string key",
                            ));
                        }
                    }
                }
                key = Some(InstanceKey::Key(text));
            } else {
                let mut digits = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ']' {
                        break;
                    }
                    digits.push(c);
                    chars.next();
                }
                let index = digits.parse::<u64>().map_err(|_| {
                    ConfigError::invalid_address(input, format!("invalid index '{digits}'"))
                })?;
                key = Some(InstanceKey::Index(index));
            }
            if chars.next() != Some(']') {
                return Err(ConfigError::invalid_address(input, "expected ']'"));
            }
        }

        segments.push(Segment { ident, key });

        match chars.next() {
            None => break,
            Some('.') => {}
            Some(c) => {
                return Err(ConfigError::invalid_address(
                    input,
                    format!("unexpected character '{c}'"),
                ));
            }
        }
    }

    Ok(segments)
}

impl FromStr for Address {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = parse_segments(s.trim())?;
        let (address, consumed) = Self::from_segments(s, &segments)?;
        if consumed != segments.len() {
            return Err(ConfigError::invalid_address(
                s,
                "unexpected trailing segments",
            ));
        }
        Ok(address)
    }
}

impl TryFrom<String> for Address {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "[{i}]"),
            Self::Key(k) => {
                f.write_str("[\"")?;
                for c in k.chars() {
                    if matches!(c, '"' | '\\') {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"]")
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for module in &self.module {
            write!(f, "module.{module}.")?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_root_address() {
        let addr: Address = "null_instance.web".parse().expect("valid address");
        assert_eq!(addr, Address::new("null_instance", "web"));
        assert!(addr.is_root_module());
    }

    #[test]
    fn test_parse_keyed_and_nested() {
        let addr: Address = r#"module.net.module.edge.null_subnet.private["qa"]"#
            .parse()
            .expect("valid address");
        assert_eq!(addr.module, vec!["net".to_string(), "edge".to_string()]);
        assert_eq!(addr.key, Some(InstanceKey::Key("qa".into())));
        assert_eq!(
            addr.to_string(),
            r#"module.net.module.edge.null_subnet.private["qa"]"#
        );

        let indexed: Address = "null_instance.web[3]".parse().expect("valid address");
        assert_eq!(indexed.key, Some(InstanceKey::Index(3)));
    }

    #[test]
    fn test_string_key_may_contain_dots() {
        let addr: Address = r#"null_dns.record["a.example.com"]"#.parse().expect("valid");
        assert_eq!(addr.key, Some(InstanceKey::Key("a.example.com".into())));
    }

    #[test]
    fn test_string_key_with_quotes_and_backslashes() {
        let addr = Address::new("null_env", "stage")
            .with_key(InstanceKey::Key(r#"a"b\c"#.into()));
        let text = addr.to_string();
        assert_eq!(text, r#"null_env.stage["a\"b\\c"]"#);

        let back: Address = text.parse().expect("escaped key parses");
        assert_eq!(back, addr);
        assert!(r#"null_env.stage["a\nb"]"#.parse::<Address>().is_err());
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("null_instance"));
        assert!(is_identifier("web-1"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("web[0]"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!("null_instance".parse::<Address>().is_err());
        assert!("null_instance.web.extra".parse::<Address>().is_err());
        assert!("null_instance.web[x]".parse::<Address>().is_err());
        assert!("null_instance[0].web".parse::<Address>().is_err());
        assert!(r#"null_instance.web["open"#.parse::<Address>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let addr = Address::new("null_instance", "web").with_key(InstanceKey::Index(1));
        let json = serde_json::to_string(&addr).expect("serialize");
        assert_eq!(json, "\"null_instance.web[1]\"");
        let back: Address = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, addr);
    }
}
