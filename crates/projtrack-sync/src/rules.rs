//! Provider registry and reviewable rule files.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use projtrack_adapters::SourceConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedVersion {
    pub version: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ExcludedVersionsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    excluded_model_versions: Vec<ExcludedVersion>,
}

#[derive(Debug, Clone, Deserialize)]
struct TransientColumnsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    providers: BTreeMap<String, Vec<String>>,
}

/// Model-version denylist plus per-provider transient column lists.
#[derive(Debug, Clone, Default)]
pub struct PipelineRules {
    excluded: Vec<ExcludedVersion>,
    transient: BTreeMap<String, Vec<String>>,
}

impl PipelineRules {
    pub fn new(excluded: Vec<ExcludedVersion>, transient: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            excluded,
            transient,
        }
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let excluded: ExcludedVersionsFile =
            read_yaml(&rules_dir.join("excluded_versions.yaml"))?;
        let transient: TransientColumnsFile =
            read_yaml(&rules_dir.join("transient_columns.yaml"))?;
        Ok(Self::new(excluded.excluded_model_versions, transient.providers))
    }

    pub fn excluded_versions(&self) -> &[ExcludedVersion] {
        &self.excluded
    }

    pub fn denylist(&self) -> HashSet<&str> {
        self.excluded.iter().map(|e| e.version.as_str()).collect()
    }

    pub fn transient_columns(&self, source_id: &str) -> Vec<String> {
        self.transient.get(source_id).cloned().unwrap_or_default()
    }
}

pub fn load_source_registry(root: &Path) -> Result<SourceRegistry> {
    read_yaml(&root.join("sources.yaml"))
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn shipped_rules_parse_and_carry_the_known_bad_version() {
        let rules = PipelineRules::from_workspace_root(&workspace_root()).unwrap();
        assert!(rules.denylist().contains("2020_04_05.05.us"));
        assert!(rules
            .excluded_versions()
            .iter()
            .all(|e| !e.reason.trim().is_empty()));
        let ihme = rules.transient_columns("ihme");
        assert!(ihme.contains(&"mobility_composite".to_string()));
        assert!(ihme.contains(&"V1".to_string()));
        assert!(rules.transient_columns("unknown").is_empty());
    }

    #[test]
    fn shipped_registry_lists_every_adapter() {
        let registry = load_source_registry(&workspace_root()).unwrap();
        for source in &registry.sources {
            assert!(
                projtrack_adapters::adapter_for_source(source).is_some(),
                "{} has no adapter",
                source.source_id
            );
        }
        let enabled = registry.enabled().map(|s| s.source_id.as_str()).collect::<Vec<_>>();
        assert_eq!(enabled, vec!["lanl", "ihme"]);
    }
}
