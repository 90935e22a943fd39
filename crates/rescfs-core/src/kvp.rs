//! Key-value-pair string codec.
//!
//! Resource context strings, rule results and negotiation payloads share a small
//! text format: `key=value` pairs separated by `;`, with `\` escaping any reserved
//! token that appears inside a key or a value. The three tokens are configurable
//! through [`KvpTokens`], but must be non-empty and must not overlap.

use std::collections::BTreeMap;

use crate::error::{ResourceError, ResourceResult};

/// Parsed key-value pairs. Ordered by key so serialization is deterministic.
pub type KvpMap = BTreeMap<String, String>;

/// Default association token.
pub const KVP_ASSOCIATION: &str = "=";
/// Default delimiter token.
pub const KVP_DELIMITER: &str = ";";
/// Default escape token.
pub const KVP_ESCAPE: &str = "\\";

/// The three reserved tokens of a KVP string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvpTokens {
    association: String,
    delimiter: String,
    escape: String,
}

impl Default for KvpTokens {
    fn default() -> Self {
        Self {
            association: KVP_ASSOCIATION.to_string(),
            delimiter: KVP_DELIMITER.to_string(),
            escape: KVP_ESCAPE.to_string(),
        }
    }
}

impl KvpTokens {
    /// Builds a validated token set.
    pub fn new(association: &str, delimiter: &str, escape: &str) -> ResourceResult<Self> {
        let tokens = Self {
            association: association.to_string(),
            delimiter: delimiter.to_string(),
            escape: escape.to_string(),
        };
        tokens.validate()?;
        Ok(tokens)
    }

    /// Association token (`=` by default).
    pub fn association(&self) -> &str {
        &self.association
    }

    /// Delimiter token (`;` by default).
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Escape token (`\` by default).
    pub fn escape_token(&self) -> &str {
        &self.escape
    }

    fn all(&self) -> [&str; 3] {
        [&self.association, &self.delimiter, &self.escape]
    }

    fn validate(&self) -> ResourceResult<()> {
        let tokens = self.all();
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(ResourceError::bad_input("kvp tokens must not be empty"));
        }
        for (i, a) in tokens.iter().enumerate() {
            for (j, b) in tokens.iter().enumerate() {
                // Containment covers equality and prefixes.
                if i != j && a.contains(b) {
                    return Err(ResourceError::bad_input(format!(
                        "kvp token {a:?} overlaps with {b:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn reserved_at<'a>(&'a self, rest: &str) -> Option<&'a str> {
        self.all().into_iter().find(|t| rest.starts_with(t))
    }

    /// Parses `input` with the strict grammar.
    pub fn parse(&self, input: &str) -> ResourceResult<KvpMap> {
        self.validate()?;

        let mut map = KvpMap::new();
        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut pos = 0;

        while pos < input.len() {
            let rest = &input[pos..];
            if rest.starts_with(self.escape.as_str()) {
                pos += self.escape.len();
                let rest = &input[pos..];
                let literal = match self.reserved_at(rest) {
                    Some(token) => token,
                    None => match rest.chars().next() {
                        Some(c) => &rest[..c.len_utf8()],
                        None => {
                            return Err(ResourceError::bad_input(format!(
                                "dangling escape token at end of {input:?}"
                            )))
                        }
                    },
                };
                if in_value {
                    value.push_str(literal);
                } else {
                    key.push_str(literal);
                }
                pos += literal.len();
            } else if rest.starts_with(self.association.as_str()) {
                if in_value {
                    return Err(ResourceError::bad_input(format!(
                        "repeated association token in segment of {input:?}"
                    )));
                }
                in_value = true;
                pos += self.association.len();
            } else if rest.starts_with(self.delimiter.as_str()) {
                if !in_value {
                    return Err(ResourceError::bad_input(format!(
                        "delimiter before association token in {input:?}"
                    )));
                }
                map.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                in_value = false;
                pos += self.delimiter.len();
            } else {
                let c = rest.chars().next().unwrap_or_default();
                if in_value {
                    value.push(c);
                } else {
                    key.push(c);
                }
                pos += c.len_utf8();
            }
        }

        if in_value {
            map.insert(key, value);
        } else if !key.is_empty() {
            return Err(ResourceError::bad_input(format!(
                "segment {key:?} has no association token"
            )));
        }
        Ok(map)
    }

    /// Serializes `map` as `key=value` pairs in key order, escaping reserved tokens when asked.
    pub fn serialize(&self, map: &KvpMap, escaping: bool) -> String {
        map.iter()
            .map(|(k, v)| {
                if escaping {
                    format!("{}{}{}", self.escape(k), self.association, self.escape(v))
                } else {
                    format!("{}{}{}", k, self.association, v)
                }
            })
            .collect::<Vec<_>>()
            .join(&self.delimiter)
    }

    /// Prefixes every reserved token in `s` with the escape token.
    pub fn escape(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        let mut pos = 0;
        while pos < s.len() {
            let rest = &s[pos..];
            match self.reserved_at(rest) {
                Some(token) => {
                    out.push_str(&self.escape);
                    out.push_str(token);
                    pos += token.len();
                }
                None => {
                    let c = rest.chars().next().unwrap_or_default();
                    out.push(c);
                    pos += c.len_utf8();
                }
            }
        }
        out
    }

    /// Reverses [`KvpTokens::escape`].
    pub fn unescape(&self, s: &str) -> ResourceResult<String> {
        let mut out = String::with_capacity(s.len());
        let mut pos = 0;
        while pos < s.len() {
            let rest = &s[pos..];
            if rest.starts_with(self.escape.as_str()) {
                pos += self.escape.len();
                let rest = &s[pos..];
                let literal = match self.reserved_at(rest) {
                    Some(token) => token,
                    None => match rest.chars().next() {
                        Some(c) => &rest[..c.len_utf8()],
                        None => {
                            return Err(ResourceError::bad_input(format!(
                                "dangling escape token at end of {s:?}"
                            )))
                        }
                    },
                };
                out.push_str(literal);
                pos += literal.len();
            } else {
                let c = rest.chars().next().unwrap_or_default();
                out.push(c);
                pos += c.len_utf8();
            }
        }
        Ok(out)
    }
}

/// Parses `input` with the default tokens.
pub fn parse_kvp(input: &str) -> ResourceResult<KvpMap> {
    KvpTokens::default().parse(input)
}

/// Parses `input` with custom tokens.
pub fn parse_kvp_with(
    input: &str,
    association: &str,
    delimiter: &str,
    escape: &str,
) -> ResourceResult<KvpMap> {
    KvpTokens::new(association, delimiter, escape)?.parse(input)
}

/// Split-based parser kept for strings produced by older writers.
///
/// Empty segments are skipped; every other segment must contain exactly one `=`.
/// No escaping is recognised.
pub fn parse_kvp_loose(input: &str) -> ResourceResult<KvpMap> {
    let mut map = KvpMap::new();
    for segment in input.split(KVP_DELIMITER).filter(|s| !s.is_empty()) {
        let parts: Vec<&str> = segment.split(KVP_ASSOCIATION).collect();
        match parts.as_slice() {
            [k, v] => {
                map.insert((*k).to_string(), (*v).to_string());
            }
            _ => {
                return Err(ResourceError::bad_input(format!(
                    "segment {segment:?} is not a single key=value pair"
                )))
            }
        }
    }
    Ok(map)
}

/// Serializes `map` with the default tokens.
pub fn serialize_kvp(map: &KvpMap, escaping: bool) -> String {
    KvpTokens::default().serialize(map, escaping)
}

/// Escapes `s` with the default tokens.
pub fn escape(s: &str) -> String {
    KvpTokens::default().escape(s)
}

/// Unescapes `s` with the default tokens.
pub fn unescape(s: &str) -> ResourceResult<String> {
    KvpTokens::default().unescape(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn map(pairs: &[(&str, &str)]) -> KvpMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_simple() {
        let parsed = parse_kvp("read=1.5;write=0.8").unwrap();
        assert_eq!(parsed, map(&[("read", "1.5"), ("write", "0.8")]));
    }

    #[test]
    fn test_parse_empty_and_trailing_delimiter() {
        assert!(parse_kvp("").unwrap().is_empty());
        let parsed = parse_kvp("auto_repl=on;").unwrap();
        assert_eq!(parsed, map(&[("auto_repl", "on")]));
    }

    #[test]
    fn test_parse_empty_value() {
        let parsed = parse_kvp("a=;b=2").unwrap();
        assert_eq!(parsed, map(&[("a", ""), ("b", "2")]));
    }

    #[test]
    fn test_parse_escaped_tokens() {
        let parsed = parse_kvp(r"path=a\;b\=c\\d;x=1").unwrap();
        assert_eq!(parsed["path"], r"a;b=c\d");
        assert_eq!(parsed["x"], "1");
    }

    #[test]
    fn test_parse_rejects_repeated_association() {
        let err = parse_kvp("a=b=c").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[test]
    fn test_parse_rejects_delimiter_before_association() {
        assert!(parse_kvp("abc;d=e").is_err());
        assert!(parse_kvp("a=1;;b=2").is_err());
    }

    #[test]
    fn test_parse_rejects_dangling_escape() {
        let err = parse_kvp(r"a=b\").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[test]
    fn test_parse_rejects_missing_association() {
        assert!(parse_kvp("a=1;lonely").is_err());
    }

    #[test]
    fn test_degenerate_tokens() {
        assert!(KvpTokens::new("", ";", "\\").is_err());
        assert!(KvpTokens::new("=", "=", "\\").is_err());
        assert!(KvpTokens::new("=", "==", "\\").is_err());
        assert!(KvpTokens::new("::", "a::b", "\\").is_err());
        assert!(parse_kvp_with("a=b", "=", ";", ";").is_err());
    }

    #[test]
    fn test_multichar_tokens() {
        let parsed = parse_kvp_with("a:=1&&b:=x%&&y", ":=", "&&", "%").unwrap();
        assert_eq!(parsed, map(&[("a", "1"), ("b", "x&&y")]));
    }

    #[test]
    fn test_serialize_sorted() {
        let m = map(&[("write", "0.8"), ("read", "1.5")]);
        assert_eq!(serialize_kvp(&m, false), "read=1.5;write=0.8");
    }

    #[test]
    fn test_serialize_escaping_roundtrip() {
        let m = map(&[("k;1", "v=1"), ("plain", r"back\slash")]);
        let text = serialize_kvp(&m, true);
        assert_eq!(text, r"k\;1=v\=1;plain=back\\slash");
        assert_eq!(parse_kvp(&text).unwrap(), m);
    }

    #[test]
    fn test_escape_unescape() {
        let s = r"a;b=c\d";
        assert_eq!(escape(s), r"a\;b\=c\\d");
        assert_eq!(unescape(&escape(s)).unwrap(), s);
        assert!(unescape(r"abc\").is_err());
    }

    #[test]
    fn test_loose_parser() {
        let parsed = parse_kvp_loose(";a=1;;b=2;").unwrap();
        assert_eq!(parsed, map(&[("a", "1"), ("b", "2")]));
        assert!(parse_kvp_loose("a=1=2").is_err());
        assert!(parse_kvp_loose("a").is_err());
    }
}
