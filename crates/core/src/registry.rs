use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDef {
    pub name: String,
    #[serde(rename = "type")]
    pub port_type: String,
}

impl PortDef {
    pub fn image(name: &str) -> Self {
        Self {
            name: name.to_string(),
            port_type: "image".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortSchema {
    #[serde(default)]
    pub inputs: Vec<PortDef>,
    #[serde(default)]
    pub outputs: Vec<PortDef>,
}

/// Editor-facing description of a processing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: String,
    pub label: String,
    pub execution: ExecutionKind,
    #[serde(default)]
    pub ports: PortSchema,
    /// JSON schema fragments for the stage's tunable settings.
    #[serde(default)]
    pub settings_schema: Vec<serde_json::Value>,
    /// True for user-defined stages; built-ins never carry it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub custom: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub ports: PortSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkDescriptor {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub ports: PortSchema,
}

/// Overlay document format: all sections optional.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryOverlay {
    #[serde(default)]
    stages: Vec<StageDescriptor>,
    #[serde(default)]
    sources: Vec<SourceDescriptor>,
    #[serde(default)]
    sinks: Vec<SinkDescriptor>,
}

/// Catalog of node types a graph may reference.
///
/// Built-ins are always present; a JSON overlay file can replace their
/// metadata, and user-defined stages are tracked separately so they can be
/// persisted without re-writing the built-in set.
pub struct StageRegistry {
    stages: BTreeMap<String, StageDescriptor>,
    sources: BTreeMap<String, SourceDescriptor>,
    sinks: BTreeMap<String, SinkDescriptor>,
    custom_ids: BTreeSet<String>,
}

impl StageRegistry {
    /// Registry containing only the built-in node types.
    pub fn builtin() -> Self {
        let mut registry = Self {
            stages: BTreeMap::new(),
            sources: BTreeMap::new(),
            sinks: BTreeMap::new(),
            custom_ids: BTreeSet::new(),
        };
        for stage in builtin_stages() {
            registry.stages.insert(stage.id.clone(), stage);
        }
        for source in builtin_sources() {
            registry.sources.insert(source.id.clone(), source);
        }
        for sink in builtin_sinks() {
            registry.sinks.insert(sink.id.clone(), sink);
        }
        registry
    }

    /// Built-ins merged with an optional JSON overlay file. A missing overlay
    /// file is not an error.
    pub fn load(overlay_path: Option<&Path>) -> Result<Self> {
        let mut registry = Self::builtin();
        if let Some(path) = overlay_path {
            if path.exists() {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read stage overlay {}", path.display()))?;
                let overlay: RegistryOverlay = serde_json::from_str(&raw)
                    .with_context(|| format!("invalid stage overlay {}", path.display()))?;
                registry.apply_overlay(overlay);
            }
        }
        Ok(registry)
    }

    fn apply_overlay(&mut self, overlay: RegistryOverlay) {
        for stage in overlay.stages {
            self.stages.insert(stage.id.clone(), stage);
        }
        for source in overlay.sources {
            self.sources.insert(source.id.clone(), source);
        }
        for sink in overlay.sinks {
            self.sinks.insert(sink.id.clone(), sink);
        }
    }

    /// Load previously saved custom stages. Returns how many were loaded.
    pub fn load_custom(&mut self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read custom stages {}", path.display()))?;
        let stages: Vec<StageDescriptor> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid custom stages file {}", path.display()))?;
        let count = stages.len();
        for stage in stages {
            self.custom_ids.insert(stage.id.clone());
            self.stages.insert(stage.id.clone(), stage);
        }
        Ok(count)
    }

    /// Persist the custom stages to `path` as a JSON array.
    pub fn save_custom(&self, path: &Path) -> Result<()> {
        let custom: Vec<&StageDescriptor> = self
            .custom_ids
            .iter()
            .filter_map(|id| self.stages.get(id))
            .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&custom)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write custom stages {}", path.display()))?;
        Ok(())
    }

    /// Register a user-defined stage. Built-in ids cannot be shadowed.
    pub fn add_custom_stage(&mut self, mut stage: StageDescriptor) -> Result<()> {
        if stage.id.trim().is_empty() {
            bail!("custom stage id must not be empty");
        }
        if self.stages.contains_key(&stage.id) && !self.custom_ids.contains(&stage.id) {
            bail!("stage id '{}' conflicts with a built-in stage", stage.id);
        }
        stage.custom = true;
        self.custom_ids.insert(stage.id.clone());
        self.stages.insert(stage.id.clone(), stage);
        Ok(())
    }

    /// Remove a user-defined stage. Built-ins cannot be removed.
    pub fn remove_custom_stage(&mut self, id: &str) -> Result<()> {
        if !self.custom_ids.remove(id) {
            bail!("stage '{id}' is not a custom stage");
        }
        self.stages.remove(id);
        Ok(())
    }

    pub fn get_stage(&self, id: &str) -> Option<&StageDescriptor> {
        self.stages.get(id)
    }

    pub fn get_source(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.get(id)
    }

    pub fn get_sink(&self, id: &str) -> Option<&SinkDescriptor> {
        self.sinks.get(id)
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.values()
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.values()
    }

    pub fn sinks(&self) -> impl Iterator<Item = &SinkDescriptor> {
        self.sinks.values()
    }

    pub fn is_custom(&self, id: &str) -> bool {
        self.custom_ids.contains(id)
    }
}

fn image_in_out() -> PortSchema {
    PortSchema {
        inputs: vec![PortDef::image("image_in")],
        outputs: vec![PortDef::image("image_out")],
    }
}

fn builtin_stages() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor {
            id: "preprocess_cpu".to_string(),
            label: "Preprocess (CPU)".to_string(),
            execution: ExecutionKind::Cpu,
            ports: image_in_out(),
            settings_schema: vec![
                json!({"name": "blur_kernel_size", "type": "integer", "default": 3, "minimum": 1}),
                json!({"name": "threshold_type", "type": "string", "default": "adaptive",
                       "enum": ["adaptive", "binary"]}),
                json!({"name": "adaptive_block_size", "type": "integer", "default": 15, "minimum": 3}),
                json!({"name": "adaptive_c", "type": "integer", "default": 3}),
                json!({"name": "binary_threshold", "type": "integer", "default": 127,
                       "minimum": 0, "maximum": 255}),
                json!({"name": "morphology", "type": "boolean", "default": false}),
                json!({"name": "morph_kernel_size", "type": "integer", "default": 3, "minimum": 1}),
            ],
            custom: false,
        },
        StageDescriptor {
            id: "preprocess_gpu".to_string(),
            label: "Preprocess (GPU)".to_string(),
            execution: ExecutionKind::Gpu,
            ports: image_in_out(),
            settings_schema: vec![
                json!({"name": "blur_kernel_size", "type": "integer", "default": 3, "minimum": 1}),
            ],
            custom: false,
        },
        StageDescriptor {
            id: "detect_apriltag_cpu".to_string(),
            label: "AprilTag Detector (CPU)".to_string(),
            execution: ExecutionKind::Cpu,
            ports: image_in_out(),
            settings_schema: vec![
                json!({"name": "family", "type": "string", "default": "tag36h11"}),
            ],
            custom: false,
        },
        StageDescriptor {
            id: "overlay_cpu".to_string(),
            label: "Detection Overlay (CPU)".to_string(),
            execution: ExecutionKind::Cpu,
            ports: image_in_out(),
            settings_schema: Vec::new(),
            custom: false,
        },
    ]
}

fn builtin_sources() -> Vec<SourceDescriptor> {
    let out_only = PortSchema {
        inputs: Vec::new(),
        outputs: vec![PortDef::image("image_out")],
    };
    vec![
        SourceDescriptor {
            id: "camera".to_string(),
            label: "Camera".to_string(),
            ports: out_only.clone(),
        },
        SourceDescriptor {
            id: "video_file".to_string(),
            label: "Video File".to_string(),
            ports: out_only.clone(),
        },
        SourceDescriptor {
            id: "image_file".to_string(),
            label: "Image File".to_string(),
            ports: out_only,
        },
    ]
}

fn builtin_sinks() -> Vec<SinkDescriptor> {
    let in_only = PortSchema {
        inputs: vec![PortDef::image("image_in")],
        outputs: Vec::new(),
    };
    vec![
        SinkDescriptor {
            id: "stream_tap".to_string(),
            label: "Stream Tap".to_string(),
            ports: in_only.clone(),
        },
        SinkDescriptor {
            id: "save_video".to_string(),
            label: "Save Video".to_string(),
            ports: in_only.clone(),
        },
        SinkDescriptor {
            id: "save_image".to_string(),
            label: "Save Image".to_string(),
            ports: in_only.clone(),
        },
        SinkDescriptor {
            id: "terminal_output".to_string(),
            label: "Terminal Output".to_string(),
            ports: in_only,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_stage(id: &str) -> StageDescriptor {
        StageDescriptor {
            id: id.to_string(),
            label: format!("Custom {id}"),
            execution: ExecutionKind::Cpu,
            ports: image_in_out(),
            settings_schema: Vec::new(),
            custom: false,
        }
    }

    #[test]
    fn test_builtin_registry_contents() {
        let registry = StageRegistry::builtin();
        assert!(registry.get_stage("preprocess_cpu").is_some());
        assert!(registry.get_stage("detect_apriltag_cpu").is_some());
        assert!(registry.get_stage("overlay_cpu").is_some());
        assert!(registry.get_source("camera").is_some());
        assert!(registry.get_sink("terminal_output").is_some());
        assert_eq!(registry.sinks().count(), 4);
    }

    #[test]
    fn test_custom_stage_lifecycle() {
        let mut registry = StageRegistry::builtin();
        registry.add_custom_stage(custom_stage("my_filter")).unwrap();
        assert!(registry.is_custom("my_filter"));
        assert!(registry.get_stage("my_filter").unwrap().custom);

        registry.remove_custom_stage("my_filter").unwrap();
        assert!(registry.get_stage("my_filter").is_none());
    }

    #[test]
    fn test_builtin_cannot_be_shadowed_or_removed() {
        let mut registry = StageRegistry::builtin();
        assert!(registry.add_custom_stage(custom_stage("preprocess_cpu")).is_err());
        assert!(registry.remove_custom_stage("overlay_cpu").is_err());
        assert!(registry.get_stage("overlay_cpu").is_some());
    }

    #[test]
    fn test_custom_stages_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");

        let mut registry = StageRegistry::builtin();
        registry.add_custom_stage(custom_stage("edge_filter")).unwrap();
        registry.add_custom_stage(custom_stage("blob_filter")).unwrap();
        registry.save_custom(&path).unwrap();

        let mut fresh = StageRegistry::builtin();
        let loaded = fresh.load_custom(&path).unwrap();
        assert_eq!(loaded, 2);
        assert!(fresh.is_custom("edge_filter"));
        assert!(fresh.get_stage("blob_filter").is_some());
    }

    #[test]
    fn test_overlay_replaces_builtin_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        std::fs::write(
            &path,
            r#"{"stages": [{"id": "preprocess_cpu", "label": "Tuned Preprocess",
                "execution": "cpu"}]}"#,
        )
        .unwrap();

        let registry = StageRegistry::load(Some(&path)).unwrap();
        assert_eq!(registry.get_stage("preprocess_cpu").unwrap().label, "Tuned Preprocess");
        // Untouched built-ins survive the overlay.
        assert!(registry.get_stage("overlay_cpu").is_some());
    }

    #[test]
    fn test_missing_overlay_is_ok() {
        let registry = StageRegistry::load(Some(Path::new("/nonexistent/overlay.json"))).unwrap();
        assert!(registry.get_stage("preprocess_cpu").is_some());
    }
}
