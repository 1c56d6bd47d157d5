//! Nested Paths
//!
//! Addresses values inside stored JSON documents with paths such as
//! `bar.name` or `list[2].id`. The first segment of a path is always the
//! top-level key of an entry; the remaining segments form the field
//! sub-path inside that entry's value.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// One step of a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object member
    Key(String),
    /// Array element
    Index(usize),
}

/// A parsed path: a top-level key followed by zero or more field segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    key: String,
    field: Vec<Segment>,
}

impl KeyPath {
    /// Parse a full path such as `bar.name` or `list[0]`
    pub fn parse(path: &str) -> Result<Self> {
        let mut segments = parse_segments(path)?.into_iter();
        match segments.next() {
            Some(Segment::Key(key)) => Ok(Self {
                key,
                field: segments.collect(),
            }),
            _ => Err(Error::path(path, "must start with a key")),
        }
    }

    /// Top-level entry key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Segments below the top-level key
    pub fn field_segments(&self) -> &[Segment] {
        &self.field
    }

    /// Canonical field sub-path, `None` when the path addresses a whole entry
    pub fn field(&self) -> Option<String> {
        if self.field.is_empty() {
            None
        } else {
            Some(render(&self.field))
        }
    }

    /// Whether the path addresses a whole entry
    pub fn is_whole(&self) -> bool {
        self.field.is_empty()
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if !self.field.is_empty() {
            if matches!(self.field[0], Segment::Key(_)) {
                write!(f, ".")?;
            }
            write!(f, "{}", render(&self.field))?;
        }
        Ok(())
    }
}

/// Parse a path into segments. A leading `[n]` is accepted so that field
/// sub-paths like `[0].id` round-trip through [`render`].
pub fn parse_segments(path: &str) -> Result<Vec<Segment>> {
    if path.is_empty() {
        return Err(Error::path(path, "empty path"));
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    // true right after a `]`, where only `.` or `[` may follow
    let mut after_index = false;

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && !after_index {
                    return Err(Error::path(path, "empty segment"));
                }
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                after_index = false;
                if chars.peek().is_none() {
                    return Err(Error::path(path, "trailing '.'"));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        Some(_) => return Err(Error::path(path, "index must be a number")),
                        None => return Err(Error::path(path, "unclosed '['")),
                    }
                }
                let index = digits
                    .parse::<usize>()
                    .map_err(|_| Error::path(path, "index must be a number"))?;
                segments.push(Segment::Index(index));
                after_index = true;
            }
            ']' => return Err(Error::path(path, "unexpected ']'")),
            _ => {
                if after_index {
                    return Err(Error::path(path, "expected '.' or '[' after index"));
                }
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }

    Ok(segments)
}

/// Render segments back into the canonical textual form
pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            Segment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// Read the value at `segments`, if present
pub fn read<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match segment {
        Segment::Key(key) => current.as_object()?.get(key),
        Segment::Index(index) => current.as_array()?.get(*index),
    })
}

/// Largest number of `null` slots a single write may add to an array
pub const MAX_INDEX_PADDING: usize = 1024;

/// Write `new` at `segments`, creating intermediate containers as needed.
/// Non-container values found along the way are replaced. Arrays are
/// padded with `null` up to the index, at most [`MAX_INDEX_PADDING`] slots.
pub fn write(value: Value, segments: &[Segment], new: Value) -> Result<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(new);
    };

    match head {
        Segment::Key(key) => {
            let mut map = match value {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            let child = map.remove(key).unwrap_or(Value::Null);
            map.insert(key.clone(), write(child, rest, new)?);
            Ok(Value::Object(map))
        }
        Segment::Index(index) => {
            let mut items = match value {
                Value::Array(items) => items,
                _ => Vec::new(),
            };
            if *index >= items.len() {
                if *index - items.len() >= MAX_INDEX_PADDING {
                    return Err(Error::path(
                        &render(segments),
                        format!("index {} is too far past the end of the array", index),
                    ));
                }
                items.resize(*index + 1, Value::Null);
            }
            let child = std::mem::take(&mut items[*index]);
            items[*index] = write(child, rest, new)?;
            Ok(Value::Array(items))
        }
    }
}

/// Remove the value at `segments`. Returns whether anything was removed.
/// Array elements are removed in place, shifting later elements down.
pub fn remove(value: &mut Value, segments: &[Segment]) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = value;
    for segment in parents {
        let next = match segment {
            Segment::Key(key) => current.as_object_mut().and_then(|m| m.get_mut(key)),
            Segment::Index(index) => current.as_array_mut().and_then(|a| a.get_mut(*index)),
        };
        match next {
            Some(next) => current = next,
            None => return false,
        }
    }

    match last {
        Segment::Key(key) => current
            .as_object_mut()
            .map(|m| m.remove(key).is_some())
            .unwrap_or(false),
        Segment::Index(index) => match current.as_array_mut() {
            Some(items) if *index < items.len() => {
                items.remove(*index);
                true
            }
            _ => false,
        },
    }
}

/// Whether `path` equals `prefix` or lies beneath it
pub fn is_within(path: &[Segment], prefix: &[Segment]) -> bool {
    path.len() >= prefix.len() && path[..prefix.len()] == *prefix
}
