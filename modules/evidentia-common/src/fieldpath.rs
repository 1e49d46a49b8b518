//! Path expressions into semi-structured document metadata.
//!
//! Paths like `parties[0].name` are parsed once into segments and used
//! identically for read, write, and rollback. Missing intermediate nodes
//! are an explicit "not found", never a panic, so partial rollbacks remain
//! well-defined.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ConsistencyError;

/// One step of a path: an object key, optionally followed by a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub key: String,
    pub index: Option<usize>,
}

/// An ordered list of segments parsed from dotted/indexed notation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    /// Parse `"parties[0].name"` style notation. Empty paths, empty keys,
    /// and malformed brackets are validation errors.
    pub fn parse(raw: &str) -> Result<Self, ConsistencyError> {
        if raw.trim().is_empty() {
            return Err(ConsistencyError::Validation("empty field path".into()));
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            segments.push(parse_segment(part, raw)?);
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Key of the first segment. Used to route party/authority side effects
    /// during propagation.
    pub fn root_key(&self) -> &str {
        &self.segments[0].key
    }

    /// Read the value at this path. Any missing or mistyped intermediate
    /// yields `None`.
    pub fn read<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for seg in &self.segments {
            current = current.as_object()?.get(&seg.key)?;
            if let Some(idx) = seg.index {
                current = current.as_array()?.get(idx)?;
            }
        }
        Some(current)
    }

    /// Write `value` at this path. Returns false (and leaves `root`
    /// untouched) when the parent chain does not exist; only a final
    /// object key may be newly created.
    pub fn write(&self, root: &mut Value, value: Value) -> bool {
        let Some((last, parents)) = self.segments.split_last() else {
            return false;
        };

        let mut current = root;
        for seg in parents {
            let Some(next) = current.as_object_mut().and_then(|o| o.get_mut(&seg.key)) else {
                return false;
            };
            current = next;
            if let Some(idx) = seg.index {
                let Some(next) = current.as_array_mut().and_then(|a| a.get_mut(idx)) else {
                    return false;
                };
                current = next;
            }
        }

        match last.index {
            None => {
                let Some(obj) = current.as_object_mut() else {
                    return false;
                };
                obj.insert(last.key.clone(), value);
                true
            }
            Some(idx) => {
                let Some(slot) = current
                    .as_object_mut()
                    .and_then(|o| o.get_mut(&last.key))
                    .and_then(|v| v.as_array_mut())
                    .and_then(|a| a.get_mut(idx))
                else {
                    return false;
                };
                *slot = value;
                true
            }
        }
    }
}

fn parse_segment(part: &str, raw: &str) -> Result<PathSegment, ConsistencyError> {
    let invalid = || ConsistencyError::Validation(format!("invalid field path: {raw}"));

    match part.find('[') {
        None => {
            if part.is_empty() {
                return Err(invalid());
            }
            Ok(PathSegment {
                key: part.to_string(),
                index: None,
            })
        }
        Some(open) => {
            let key = &part[..open];
            let rest = &part[open + 1..];
            let close = rest.find(']').ok_or_else(invalid)?;
            if key.is_empty() || close + 1 != rest.len() {
                return Err(invalid());
            }
            let index: usize = rest[..close].parse().map_err(|_| invalid())?;
            Ok(PathSegment {
                key: key.to_string(),
                index: Some(index),
            })
        }
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", seg.key)?;
            if let Some(idx) = seg.index {
                write!(f, "[{idx}]")?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for FieldPath {
    type Err = ConsistencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::parse(s)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FieldPath::parse(&raw).map_err(D::Error::custom)
    }
}
