use std::{collections::BTreeMap, fs, path::Path};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

static COLUMN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_:.\-]{0,62}$").expect("column name pattern"));

static TABLE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("table prefix pattern"));

/// Which geometry kinds a tag is promoted to a column for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    #[serde(default)]
    pub node: bool,
    #[serde(default)]
    pub way: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTagSpec {
    pub target_key: String,
}

/// Tag policy supplied by the caller. Read once per export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Style {
    /// Sorted by key, so derived column order never depends on file order.
    pub keys: BTreeMap<String, KeySpec>,
    #[serde(default)]
    pub other_tags: bool,
    #[serde(default)]
    pub parent_tags: Vec<String>,
    #[serde(default)]
    pub relation_tag_spec: Vec<RelationTagSpec>,
}

impl Style {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ExportError::Style {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;
        let style: Style = serde_json::from_str(&text).map_err(|e| ExportError::Style {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;
        style.validate()?;
        Ok(style)
    }

    pub fn with_keys<'a, I>(keys: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, bool, bool)>,
    {
        Style {
            keys: keys
                .into_iter()
                .map(|(k, node, way)| (k.to_string(), KeySpec { node, way }))
                .collect(),
            ..Default::default()
        }
    }

    pub fn node_keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().filter(|(_, s)| s.node).map(|(k, _)| k.as_str())
    }

    pub fn way_keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().filter(|(_, s)| s.way).map(|(k, _)| k.as_str())
    }

    /// Every tag name that ends up quoted in DDL must pass the column name pattern.
    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(ExportError::Config("style has no keys".to_string()));
        }
        let names = self
            .keys
            .keys()
            .chain(self.parent_tags.iter())
            .chain(self.relation_tag_spec.iter().map(|r| &r.target_key));
        for name in names {
            check_column_name(name)?;
        }
        Ok(())
    }
}

pub fn check_column_name(name: &str) -> Result<()> {
    if COLUMN_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ExportError::Config(format!("invalid column name {:?}", name)))
    }
}

pub fn check_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || TABLE_PREFIX.is_match(prefix) {
        Ok(())
    } else {
        Err(ExportError::Config(format!("invalid table prefix {:?}", prefix)))
    }
}
