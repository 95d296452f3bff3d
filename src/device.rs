//! Recorder model definitions, with model-specific capability flags.
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A recorder model line. Individual models inherit capability flags
/// from the family when they don't set their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    bluetooth: Option<bool>,
    pub models: Vec<Model>,
}

/// One recorder hardware model, identified by the code reported in
/// `GET_DEVICE_INFO`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(deserialize_with = "parse_model_code")]
    pub model_code: u16,
    #[serde(default)]
    pub description: String,
    bluetooth: Option<bool>,
}

impl ::std::fmt::Display for Model {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(0x{:04x})", self.name, self.model_code)
    }
}

impl Model {
    /// Whether the Bluetooth command family is valid for this model.
    pub fn supports_bluetooth(&self) -> bool {
        self.bluetooth.unwrap_or(false)
    }
}

/// The embedded model catalog.
pub struct ModelDb {
    families: Vec<Family>,
}

impl ModelDb {
    pub fn load() -> Result<Self> {
        let family: Family = serde_yaml::from_str(include_str!("../devices/models.yaml"))
            .map_err(|e| Error::protocol(format!("model catalog: {e}")))?;
        Ok(ModelDb {
            families: vec![family],
        })
    }

    /// Look up the model for a reported code. Unknown codes are an
    /// error, matching the device catalog being a closed list.
    pub fn find_model(model_code: u16) -> Result<Model> {
        let db = ModelDb::load()?;
        for family in &db.families {
            if let Some(model) = family.models.iter().find(|m| m.model_code == model_code) {
                let mut model = model.clone();
                if model.bluetooth.is_none() {
                    model.bluetooth = family.bluetooth;
                }
                log::debug!("matched model {} in family {}", model, family.name);
                return Ok(model);
            }
        }
        Err(Error::protocol(format!(
            "unknown model code 0x{model_code:04x}"
        )))
    }
}

fn parse_model_code<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = if let Some(hex_str) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex_str, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| serde::de::Error::custom(format!("bad model code {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_loads() {
        let db = ModelDb::load().unwrap();
        assert!(!db.families.is_empty());
        assert!(!db.families[0].models.is_empty());
    }

    #[test]
    fn known_models_resolve_with_inherited_flags() {
        let base = ModelDb::find_model(0x0010).unwrap();
        assert_eq!(base.name, "VP10");
        assert!(!base.supports_bluetooth());

        let pro = ModelDb::find_model(0x0011).unwrap();
        assert_eq!(pro.name, "VP10 Pro");
        assert!(pro.supports_bluetooth());
    }

    #[test]
    fn unknown_model_code_is_an_error() {
        assert!(matches!(
            ModelDb::find_model(0xbeef),
            Err(Error::Protocol(_))
        ));
    }
}
