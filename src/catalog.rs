//! Instance type catalog
//!
//! Instance types are declared as pod templates in a YAML document: either a
//! multi-document stream or a `kind: List`. Each entry's `metadata.name` is
//! the type id and `hakoniwa.aplulu.me/*` annotations supply the catalog
//! fields. The catalog is immutable after load.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Annotation prefix for catalog fields and managed-pod metadata
pub const ANNOTATION_PREFIX: &str = "hakoniwa.aplulu.me/";

/// Built-in pod template used when POD_TEMPLATE_PATH is not set
const DEFAULT_POD_TEMPLATE: &str = include_str!("../templates/pod_template.yaml");

/// A launchable workspace flavor
#[derive(Debug, Clone)]
pub struct InstanceType {
    pub id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    /// Backend port the proxy targets; a string so named ports stay usable
    pub target_port: String,
    /// Whether this type may be created with a persistent volume
    pub persistable: bool,
    pub volume_size: Option<String>,
    pub volume_path: Option<String>,
    pub volume_storage_class: Option<String>,
    /// The re-serialized pod template for this type
    pub template: Vec<u8>,
}

/// Immutable catalog of instance types, keyed by id
#[derive(Debug, Default)]
pub struct Catalog {
    types: HashMap<String, InstanceType>,
}

impl Catalog {
    /// Load the catalog from a template file, or the built-in template.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let content = match path {
            Some(p) => std::fs::read(p)
                .with_context(|| format!("failed to read pod template {}", p.display()))?,
            None => DEFAULT_POD_TEMPLATE.as_bytes().to_vec(),
        };
        Self::from_yaml(&content)
    }

    /// Parse a catalog from YAML bytes (multi-document stream or `kind: List`).
    pub fn from_yaml(content: &[u8]) -> Result<Self> {
        let mut types = HashMap::new();

        for document in serde_yaml::Deserializer::from_slice(content) {
            let value = serde_yaml::Value::deserialize(document)
                .context("failed to decode pod template document")?;
            if value.is_null() {
                continue;
            }

            let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or("");
            if kind == "List" {
                let items = value
                    .get("items")
                    .and_then(|i| i.as_sequence())
                    .context("pod template List has no items")?;
                for item in items {
                    let it = parse_instance_type(item)?;
                    types.insert(it.id.clone(), it);
                }
            } else {
                let it = parse_instance_type(&value)?;
                types.insert(it.id.clone(), it);
            }
        }

        Ok(Self { types })
    }

    pub fn get(&self, id: &str) -> Option<&InstanceType> {
        self.types.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.types.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// All types, sorted by display name for stable dashboard ordering
    pub fn list(&self) -> Vec<&InstanceType> {
        let mut all: Vec<&InstanceType> = self.types.values().collect();
        all.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        all
    }
}

fn parse_instance_type(value: &serde_yaml::Value) -> Result<InstanceType> {
    let metadata = value
        .get("metadata")
        .context("missing metadata in pod template")?;
    let name = metadata
        .get("name")
        .and_then(|n| n.as_str())
        .context("missing metadata.name in pod template")?
        .to_string();

    let annotation = |key: &str| -> Option<String> {
        let full_key = format!("{}{}", ANNOTATION_PREFIX, key);
        metadata
            .get("annotations")
            .and_then(|a| a.get(full_key.as_str()))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    let display_name = annotation("display-name").unwrap_or_else(|| name.clone());
    let logo_url = annotation("image-url").or_else(|| annotation("logo-url"));
    let target_port = annotation("port").unwrap_or_else(|| "3000".to_string());
    let persistable = annotation("persistable").map(|v| v == "true").unwrap_or(false);

    let template = serde_yaml::to_string(value)
        .context("failed to re-serialize pod template item")?
        .into_bytes();

    Ok(InstanceType {
        id: name,
        display_name,
        description: annotation("description"),
        logo_url,
        target_port,
        persistable,
        volume_size: annotation("volume-size"),
        volume_path: annotation("volume-path"),
        volume_storage_class: annotation("volume-storage-class"),
        template,
    })
}
