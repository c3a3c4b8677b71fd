//! Strongly-typed lane catalog, loaded from a TOML file.
//!
//! The catalog names the lanes an installation operates, so bulk
//! commands (launch-all) work from a declared fleet instead of whatever
//! happens to be registered. Parsed and validated once at startup.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::LaneKey;

#[derive(Debug, Deserialize)]
pub struct LaneCatalog {
    #[serde(default)]
    pub lanes: Vec<LaneDef>,
}

#[derive(Debug, Deserialize)]
pub struct LaneDef {
    pub owner: i32,
    pub category: String,
}

impl LaneCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog: LaneCatalog = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("bad lane catalog {}: {e}", path.display())))?;
        // Same validation as every other lane entry point.
        for def in &catalog.lanes {
            format!("{}:{}", def.owner, def.category)
                .parse::<LaneKey>()
                .map_err(|e| Error::Config(format!("{e} in {}", path.display())))?;
        }
        Ok(catalog)
    }

    pub fn lane_keys(&self) -> Vec<LaneKey> {
        self.lanes
            .iter()
            .map(|d| LaneKey::new(d.owner, d.category.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_catalog() {
        let catalog: LaneCatalog = toml::from_str(
            r#"
            [[lanes]]
            owner = 7
            category = "annotation"

            [[lanes]]
            owner = 7
            category = "review"
            "#,
        )
        .unwrap();
        let keys: Vec<String> = catalog.lane_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["7:annotation", "7:review"]);
    }

    #[test]
    fn empty_catalog_has_no_lanes() {
        let catalog: LaneCatalog = toml::from_str("").unwrap();
        assert!(catalog.lane_keys().is_empty());
    }

    #[test]
    fn load_rejects_unsafe_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanes.toml");
        std::fs::write(&path, "[[lanes]]\nowner = 1\ncategory = \"bad category\"\n").unwrap();
        assert!(LaneCatalog::load(&path).is_err());
    }
}
