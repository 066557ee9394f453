//! Identity id to display name mapping.
//!
//! File format, one entry per line:
//!
//! ```text
//! 1:alice
//! 2:bob
//! ```

use std::collections::HashMap;
use std::path::Path;

use crate::error::IdentityMapError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMap {
    names: HashMap<i32, String>,
}

impl IdentityMap {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityMapError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| IdentityMapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Blank lines are skipped. A repeated id keeps the last name.
    pub fn parse(text: &str) -> Result<Self, IdentityMapError> {
        let mut names = HashMap::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let malformed = || IdentityMapError::Malformed {
                line: index + 1,
                content: raw.to_string(),
            };
            let (id, name) = line.split_once(':').ok_or_else(malformed)?;
            let id: i32 = id.trim().parse().map_err(|_| malformed())?;
            let name = name.trim();
            if name.is_empty() {
                return Err(malformed());
            }
            names.insert(id, name.to_string());
        }
        Ok(Self { names })
    }

    pub fn get(&self, id: i32) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<(i32, String)> for IdentityMap {
    fn from_iter<I: IntoIterator<Item = (i32, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}
