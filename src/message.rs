//! Collaborator interfaces to the host's message representation.
//!
//! The engine never touches wire-level HTTP/2 framing. The host hands it a
//! header map and body per direction through these traits; the in-memory
//! implementations below are what the test suite and simple hosts use.

use serde_json::Value;
use std::collections::BTreeMap;

/// Which half of the exchange a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    /// Index into per-direction storage pairs.
    pub fn idx(self) -> usize {
        match self {
            Direction::Request => 0,
            Direction::Response => 1,
        }
    }
}

/// Case-insensitive header source/sink.
pub trait HeaderMap: Send {
    /// All values for `name`, in insertion order. Empty if absent.
    fn get(&self, name: &str) -> Vec<String>;

    /// Replace all values for `name` with `value`.
    fn set(&mut self, name: &str, value: &str);

    /// Append a further value for `name`.
    fn add(&mut self, name: &str, value: &str);

    fn remove(&mut self, name: &str);

    fn contains(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }
}

/// Message body source/sink.
pub trait Body: Send {
    fn is_present(&self) -> bool;

    /// Parse the body as JSON. `Err` means present-but-malformed.
    fn as_json(&self) -> Result<Value, BodyError>;

    fn set_from_json(&mut self, value: &Value);

    /// Read a JSON-pointer-addressed element. `None` for absent body,
    /// malformed JSON, or a pointer that resolves to nothing.
    fn read_pointer(&self, pointer: &str) -> Option<Value> {
        self.as_json().ok()?.pointer(pointer).cloned()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed JSON body: {0}")]
pub struct BodyError(pub String);

/// Both sides of one in-flight exchange, as mutable collaborator handles.
pub struct Exchange<'m> {
    pub request_headers: &'m mut dyn HeaderMap,
    pub response_headers: &'m mut dyn HeaderMap,
    pub request_body: &'m mut dyn Body,
    pub response_body: &'m mut dyn Body,
}

impl<'m> Exchange<'m> {
    pub fn headers(&self, direction: Direction) -> &dyn HeaderMap {
        match direction {
            Direction::Request => self.request_headers,
            Direction::Response => self.response_headers,
        }
    }

    pub fn headers_mut(&mut self, direction: Direction) -> &mut dyn HeaderMap {
        match direction {
            Direction::Request => self.request_headers,
            Direction::Response => self.response_headers,
        }
    }

    pub fn body(&self, direction: Direction) -> &dyn Body {
        match direction {
            Direction::Request => self.request_body,
            Direction::Response => self.response_body,
        }
    }

    pub fn body_mut(&mut self, direction: Direction) -> &mut dyn Body {
        match direction {
            Direction::Request => self.request_body,
            Direction::Response => self.response_body,
        }
    }
}

/// Header map backed by a lowercase-keyed ordered map.
#[derive(Debug, Clone, Default)]
pub struct MemoryHeaderMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl MemoryHeaderMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeaderMap for MemoryHeaderMap {
    fn get(&self, name: &str) -> Vec<String> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    fn set(&mut self, name: &str, value: &str) {
        self.entries
            .insert(name.to_ascii_lowercase(), vec![value.to_string()]);
    }

    fn add(&mut self, name: &str, value: &str) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }

    fn remove(&mut self, name: &str) {
        self.entries.remove(&name.to_ascii_lowercase());
    }
}

/// Body holding raw bytes, JSON-parsed on demand.
#[derive(Debug, Clone, Default)]
pub struct MemoryBody {
    raw: Option<Vec<u8>>,
}

impl MemoryBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { raw: Some(bytes.into()) }
    }

    pub fn from_json(value: &Value) -> Self {
        Self { raw: Some(value.to_string().into_bytes()) }
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }
}

impl Body for MemoryBody {
    fn is_present(&self) -> bool {
        self.raw.as_ref().is_some_and(|b| !b.is_empty())
    }

    fn as_json(&self) -> Result<Value, BodyError> {
        let raw = self
            .raw
            .as_deref()
            .ok_or_else(|| BodyError("no body".into()))?;
        serde_json::from_slice(raw).map_err(|e| BodyError(e.to_string()))
    }

    fn set_from_json(&mut self, value: &Value) {
        self.raw = Some(value.to_string().into_bytes());
    }
}
