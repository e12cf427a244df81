//! Geometry record that addresses a cached latent and travels with it as metadata.

use crate::sidecar::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentInfo {
    /// Source basename including extension.
    pub filename: String,
    pub scale_to_width: u32,
    pub scale_to_height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_width: u32,
    pub crop_height: u32,
    /// Encoder family, e.g. `sd1` or `sdxl`.
    pub latent_space_version: String,
    /// Bumped when the stored latent format changes.
    pub latent_version: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub flip_x: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub flip_y: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl LatentInfo {
    /// Key/value view with sorted keys. Flip keys are added only when true so records
    /// written before flips existed keep their digest.
    pub fn canonical_map(&self) -> BTreeMap<&'static str, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert("filename", serde_json::Value::from(self.filename.clone()));
        map.insert("scale_to_width", self.scale_to_width.into());
        map.insert("scale_to_height", self.scale_to_height.into());
        map.insert("crop_x", self.crop_x.into());
        map.insert("crop_y", self.crop_y.into());
        map.insert("crop_width", self.crop_width.into());
        map.insert("crop_height", self.crop_height.into());
        map.insert(
            "latent_space_version",
            serde_json::Value::from(self.latent_space_version.clone()),
        );
        map.insert("latent_version", self.latent_version.into());
        if self.flip_x {
            map.insert("flip_x", true.into());
        }
        if self.flip_y {
            map.insert("flip_y", true.into());
        }
        map
    }

    /// Compact JSON of [`Self::canonical_map`]; the input to the cache digest.
    pub fn canonical_json(&self) -> Vec<u8> {
        // A map of plain scalars cannot fail to serialize.
        serde_json::to_vec(&self.canonical_map()).unwrap_or_default()
    }

    /// String map suitable for a safetensors `__metadata__` block.
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        self.canonical_map()
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k.to_string(), value)
            })
            .collect()
    }

    pub fn from_metadata(meta: &BTreeMap<String, String>) -> Result<Self, ValidationError> {
        fn text(
            meta: &BTreeMap<String, String>,
            key: &'static str,
        ) -> Result<String, ValidationError> {
            meta.get(key)
                .cloned()
                .ok_or(ValidationError::MissingKey(key))
        }
        fn number(meta: &BTreeMap<String, String>, key: &'static str) -> Result<u32, ValidationError> {
            let raw = text(meta, key)?;
            raw.trim()
                .parse()
                .map_err(|_| ValidationError::InvalidValue { key, value: raw })
        }
        fn flag(meta: &BTreeMap<String, String>, key: &'static str) -> Result<bool, ValidationError> {
            match meta.get(key).map(|s| s.trim()) {
                None => Ok(false),
                Some("true") => Ok(true),
                Some("false") => Ok(false),
                Some(other) => Err(ValidationError::InvalidValue {
                    key,
                    value: other.to_string(),
                }),
            }
        }
        let info = LatentInfo {
            filename: text(meta, "filename")?,
            scale_to_width: number(meta, "scale_to_width")?,
            scale_to_height: number(meta, "scale_to_height")?,
            crop_x: number(meta, "crop_x")?,
            crop_y: number(meta, "crop_y")?,
            crop_width: number(meta, "crop_width")?,
            crop_height: number(meta, "crop_height")?,
            latent_space_version: text(meta, "latent_space_version")?,
            latent_version: number(meta, "latent_version")?,
            flip_x: flag(meta, "flip_x")?,
            flip_y: flag(meta, "flip_y")?,
        };
        info.validate()?;
        Ok(info)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.filename.trim().is_empty() {
            return Err(ValidationError::EmptyFilename);
        }
        Ok(())
    }
}
