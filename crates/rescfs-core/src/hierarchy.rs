//! Resource hierarchy paths.
//!
//! A hierarchy is the root-to-leaf chain of resource names that services one
//! request, written canonically as `root;compound;cache`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, ResourceResult};

/// Separator between resource names in the canonical string form.
pub const HIERARCHY_DELIMITER: &str = ";";

/// Ordered list of resource names, root first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HierarchyPath {
    names: Vec<String>,
}

impl HierarchyPath {
    /// Creates an empty hierarchy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the canonical `a;b;c` form. The empty string is the empty hierarchy.
    pub fn from_string(s: &str) -> ResourceResult<Self> {
        let mut path = Self::new();
        if s.is_empty() {
            return Ok(path);
        }
        for name in s.split(HIERARCHY_DELIMITER) {
            path.add_child(name)?;
        }
        Ok(path)
    }

    /// Appends `name` as the new leaf.
    ///
    /// Empty names and names already in the path are rejected with `BadInput`
    /// and the path is left unchanged.
    pub fn add_child(&mut self, name: &str) -> ResourceResult<()> {
        if name.is_empty() {
            return Err(ResourceError::bad_input("empty resource name in hierarchy"));
        }
        if name.contains(HIERARCHY_DELIMITER) {
            return Err(ResourceError::bad_input(format!(
                "resource name {name:?} contains the hierarchy delimiter"
            )));
        }
        if self.contains(name) {
            return Err(ResourceError::bad_input(format!(
                "resource {name} already in hierarchy {self}"
            )));
        }
        self.names.push(name.to_string());
        Ok(())
    }

    /// Returns a copy of this path extended with `name`.
    pub fn with_child(&self, name: &str) -> ResourceResult<Self> {
        let mut path = self.clone();
        path.add_child(name)?;
        Ok(path)
    }

    /// The resource that follows `current`.
    pub fn next(&self, current: &str) -> ResourceResult<&str> {
        let idx = self.position(current)?;
        self.names
            .get(idx + 1)
            .map(String::as_str)
            .ok_or_else(|| ResourceError::not_found(format!("{current} is the leaf of {self}")))
    }

    /// Whether `name` appears anywhere in the path.
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// The root resource.
    pub fn first(&self) -> ResourceResult<&str> {
        self.names
            .first()
            .map(String::as_str)
            .ok_or_else(|| ResourceError::not_found("root of empty hierarchy"))
    }

    /// The leaf resource.
    pub fn last(&self) -> ResourceResult<&str> {
        self.names
            .last()
            .map(String::as_str)
            .ok_or_else(|| ResourceError::not_found("leaf of empty hierarchy"))
    }

    /// Drops `name` together with every resource below it.
    pub fn remove(&mut self, name: &str) -> ResourceResult<()> {
        let idx = self.position(name)?;
        self.names.truncate(idx);
        Ok(())
    }

    /// The sub-path from the root down to and including `name`.
    pub fn prefix_through(&self, name: &str) -> ResourceResult<Self> {
        let idx = self.position(name)?;
        Ok(Self {
            names: self.names[..=idx].to_vec(),
        })
    }

    /// Number of resources in the path.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True for the empty hierarchy.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterates names from root to leaf.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    fn position(&self, name: &str) -> ResourceResult<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| ResourceError::not_found(format!("{name} in hierarchy {self}")))
    }
}

impl fmt::Display for HierarchyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names.join(HIERARCHY_DELIMITER))
    }
}

impl FromStr for HierarchyPath {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

impl TryFrom<String> for HierarchyPath {
    type Error = ResourceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_string(&s)
    }
}

impl From<HierarchyPath> for String {
    fn from(path: HierarchyPath) -> Self {
        path.to_string()
    }
}
