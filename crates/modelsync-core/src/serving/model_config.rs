//! Model list documents.
//!
//! Upstream, an optional YAML document lists the models to serve:
//!
//! ```yaml
//! model_config:
//!   - name: ranker
//!     base_path: hdfs://ns1/serving/models/ranker
//!     model_platform: tensorflow
//!     version_labels: { stable: 4, canary: 5 }
//!     version_policy: { latest: "{ num_versions: 2 }" }
//! ```
//!
//! Locally, the same entries are rendered as a TF Serving `models.config`
//! pointing at the synced directories.

use crate::config::SyncDefaults;
use crate::error::{Result, SyncError};
use crate::metadata::atomic_write_bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info};

fn default_platform() -> String {
    SyncDefaults::MODEL_PLATFORM.to_string()
}

/// One model in a model list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfigEntry {
    pub name: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_platform")]
    pub model_platform: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub version_labels: BTreeMap<String, u64>,
    /// Each entry is emitted verbatim as `key: value` inside `version_policy`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub version_policy: BTreeMap<String, String>,
}

impl ModelConfigEntry {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_path: String::new(),
            model_platform: platform.into(),
            version_labels: BTreeMap::new(),
            version_policy: BTreeMap::new(),
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }
}

/// A list of models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfigList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub model_config: Vec<ModelConfigEntry>,
}

impl ModelConfigList {
    /// Parse a YAML model list. An empty document is an empty list; unknown
    /// keys are ignored. Malformed YAML is an error.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        let list: Self = serde_yaml::from_value(value)?;
        for entry in &list.model_config {
            if entry.name.trim().is_empty() {
                return Err(SyncError::Other(
                    "Model list contains an entry without a name".to_string(),
                ));
            }
        }
        Ok(list)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Render entries as TF Serving `ModelServerConfig` text.
pub fn render_model_config(entries: &[ModelConfigEntry]) -> String {
    let mut out = String::from("model_config_list {\n");
    for entry in entries {
        out.push_str("  config {\n");
        let _ = writeln!(out, "    name: \"{}\"", escape(&entry.name));
        let _ = writeln!(out, "    base_path: \"{}\"", escape(&entry.base_path));
        let _ = writeln!(out, "    model_platform: \"{}\"", escape(&entry.model_platform));
        if !entry.version_policy.is_empty() {
            out.push_str("    model_version_policy {\n");
            for (key, value) in &entry.version_policy {
                let _ = writeln!(out, "      {}: {}", key, value);
            }
            out.push_str("    }\n");
        }
        for (label, version) in &entry.version_labels {
            let _ = writeln!(
                out,
                "    version_labels {{ key: \"{}\" value: {} }}",
                escape(label),
                version
            );
        }
        out.push_str("  }\n");
    }
    out.push_str("}\n");
    out
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Write `models.config` into `root` if its content would change.
///
/// Returns `true` when the file was written.
pub fn write_model_config(root: &Path, entries: &[ModelConfigEntry]) -> Result<bool> {
    let path = root.join(SyncDefaults::MODEL_CONFIG_FILENAME);
    let rendered = render_model_config(entries);

    match std::fs::read(&path) {
        Ok(existing) if existing == rendered.as_bytes() => {
            debug!(path = %path.display(), "models.config unchanged");
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::io_with_path(e, &path)),
    }

    atomic_write_bytes(&path, rendered.as_bytes())?;
    info!(path = %path.display(), models = entries.len(), "Wrote models.config");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_model_list() {
        let yaml = r#"
model_config:
  - name: ranker
    base_path: hdfs://ns1/serving/models/ranker
    version_labels: { stable: 4 }
    extra_field: ignored
  - name: embedder
    base_path: /serving/embedder
    model_platform: onnx
    version_labels: null
"#;
        let list = ModelConfigList::from_yaml(yaml).unwrap();
        assert_eq!(list.model_config.len(), 2);
        assert_eq!(list.model_config[0].model_platform, "tensorflow");
        assert_eq!(list.model_config[0].version_labels.get("stable"), Some(&4));
        assert_eq!(list.model_config[1].model_platform, "onnx");
        assert!(list.model_config[1].version_labels.is_empty());
    }

    #[test]
    fn test_empty_document_is_empty_list() {
        assert!(ModelConfigList::from_yaml("").unwrap().model_config.is_empty());
        assert!(ModelConfigList::from_yaml("model_config:\n").unwrap().model_config.is_empty());
    }

    #[test]
    fn test_malformed_yaml_is_error() {
        assert!(ModelConfigList::from_yaml("model_config: [unclosed").is_err());
        assert!(ModelConfigList::from_yaml("model_config:\n  - base_path: /x\n").is_err());
    }

    #[test]
    fn test_render_model_config() {
        let mut entry = ModelConfigEntry::new("ranker", "tensorflow").with_base_path("/models/ranker");
        entry.version_labels.insert("stable".to_string(), 4);
        entry
            .version_policy
            .insert("latest".to_string(), "{ num_versions: 2 }".to_string());

        let rendered = render_model_config(&[entry]);
        assert_eq!(
            rendered,
            "model_config_list {\n  config {\n    name: \"ranker\"\n    base_path: \"/models/ranker\"\n    model_platform: \"tensorflow\"\n    model_version_policy {\n      latest: { num_versions: 2 }\n    }\n    version_labels { key: \"stable\" value: 4 }\n  }\n}\n"
        );
    }

    #[test]
    fn test_write_only_when_changed() {
        let tmp = TempDir::new().unwrap();
        let entries = vec![ModelConfigEntry::new("a", "tensorflow").with_base_path("/models/a")];

        assert!(write_model_config(tmp.path(), &entries).unwrap());
        assert!(!write_model_config(tmp.path(), &entries).unwrap());

        let changed = vec![ModelConfigEntry::new("b", "tensorflow").with_base_path("/models/b")];
        assert!(write_model_config(tmp.path(), &changed).unwrap());
        let content = std::fs::read_to_string(tmp.path().join("models.config")).unwrap();
        assert!(content.contains("name: \"b\""));
    }
}
