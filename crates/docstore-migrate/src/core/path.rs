//! Collection, document and field paths.
//!
//! Store paths are slash-separated segment lists. A collection path has an odd
//! number of segments (`users`, `users/u1/children`), a document path an even
//! number (`users/u1`). Paths are plain strings underneath so they can be used
//! as keys on the deletion work stack and in error reports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Maximum segment length accepted by the store.
const MAX_SEGMENT_LENGTH: usize = 1500;

/// Validate a single path segment.
///
/// Rejects empty segments, segments containing `/` or null bytes, the
/// reserved `.`/`..` names and over-long segments.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(MigrateError::validation(segment, "path segment cannot be empty"));
    }
    if segment.contains('/') {
        return Err(MigrateError::validation(
            segment,
            "path segment cannot contain '/'",
        ));
    }
    if segment.contains('\0') {
        return Err(MigrateError::validation(
            segment,
            "path segment contains a null byte",
        ));
    }
    if segment == "." || segment == ".." {
        return Err(MigrateError::validation(segment, "reserved path segment"));
    }
    if segment.len() > MAX_SEGMENT_LENGTH {
        return Err(MigrateError::validation(
            segment,
            format!(
                "path segment exceeds {} bytes (got {})",
                MAX_SEGMENT_LENGTH,
                segment.len()
            ),
        ));
    }
    Ok(())
}

fn split_validated(path: &str) -> Result<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(MigrateError::validation(path, "path cannot be empty"));
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    for segment in &segments {
        validate_segment(segment).map_err(|_| {
            MigrateError::validation(path, format!("invalid path segment {:?}", segment))
        })?;
    }
    Ok(segments)
}

/// Path of a collection or subcollection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Parse a collection path, requiring an odd number of segments.
    pub fn parse(path: &str) -> Result<Self> {
        let segments = split_validated(path)?;
        if segments.len() % 2 == 0 {
            return Err(MigrateError::validation(
                path,
                "collection path must have an odd number of segments",
            ));
        }
        Ok(Self(segments.join("/")))
    }

    /// Collection id (last segment).
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Document owning this collection, `None` for root collections.
    pub fn parent(&self) -> Option<DocumentPath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| DocumentPath(parent.to_string()))
    }

    /// Path of the document `id` inside this collection.
    pub fn doc(&self, id: &str) -> Result<DocumentPath> {
        validate_segment(id)?;
        Ok(DocumentPath(format!("{}/{}", self.0, id)))
    }

    /// Number of path segments.
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Immutable path of a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Parse a document path, requiring an even number of segments.
    pub fn parse(path: &str) -> Result<Self> {
        let segments = split_validated(path)?;
        if segments.len() % 2 != 0 {
            return Err(MigrateError::validation(
                path,
                "document path must have an even number of segments",
            ));
        }
        Ok(Self(segments.join("/")))
    }

    /// Document id (last segment).
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Collection containing this document.
    pub fn collection(&self) -> CollectionPath {
        let (parent, _) = self
            .0
            .rsplit_once('/')
            .unwrap_or((self.0.as_str(), ""));
        CollectionPath(parent.to_string())
    }

    /// Path of the subcollection `name` under this document.
    pub fn subcollection(&self, name: &str) -> Result<CollectionPath> {
        validate_segment(name)?;
        Ok(CollectionPath(format!("{}/{}", self.0, name)))
    }

    /// Whether `self` is `other` or lies anywhere beneath it.
    pub fn is_within(&self, other: &DocumentPath) -> bool {
        self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_path_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = MigrateError;

            fn try_from(value: String) -> Result<Self> {
                $ty::parse(&value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> String {
                value.0
            }
        }

        impl std::str::FromStr for $ty {
            type Err = MigrateError;

            fn from_str(s: &str) -> Result<Self> {
                $ty::parse(s)
            }
        }
    };
}

string_path_impls!(CollectionPath);
string_path_impls!(DocumentPath);

/// Dotted path to a (possibly nested) field, e.g. `profile.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(MigrateError::validation(path, "field path cannot be empty"));
        }
        let parts: Vec<String> = path.split('.').map(str::to_string).collect();
        if parts.iter().any(String::is_empty) {
            return Err(MigrateError::validation(
                path,
                "field path cannot contain empty components",
            ));
        }
        Ok(Self(parts))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `self` equals `other` or is nested inside it.
    pub fn starts_with(&self, other: &FieldPath) -> bool {
        self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl TryFrom<String> for FieldPath {
    type Error = MigrateError;

    fn try_from(value: String) -> Result<Self> {
        FieldPath::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(value: FieldPath) -> String {
        value.to_string()
    }
}

impl std::str::FromStr for FieldPath {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        FieldPath::parse(s)
    }
}
