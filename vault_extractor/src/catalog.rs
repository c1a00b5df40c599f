//! Versioned description of the byte patterns that identify the routine and the
//! instruction referencing its request record.
//!
//! Catalogs are JSON documents. Patterns are hex strings (whitespace between bytes is
//! ignored), addresses and offsets are either JSON numbers or `"0x..."` strings:
//!
//! ```json
//! {
//!     "name": "build 22621",
//!     "window": { "begin": "0x1c0000000", "end": "0x1d0000000" },
//!     "routine": [ { "pattern": "4c 8b dc 49 89 4b 08", "size": "0x4e" } ],
//!     "request_reference": [ { "pattern": "c6 45 00 19 0f b6 45", "operand_offset": "0x50" } ]
//! }
//! ```

use crate::resolver::OPERAND_WIDTH;
use serde::{de, Deserialize, Deserializer};
use std::path::Path;
use vault_commons::{VaultError, VaultResult};
use vault_machine::ImageInfo;

/// How far past the end of a pattern the relative operand may sit
pub const LOOKAHEAD: u64 = 0x100;

/// Half open address range a scan is restricted to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Window {
    #[serde(deserialize_with = "number")]
    pub begin: u64,
    #[serde(deserialize_with = "number")]
    pub end: u64,
}

impl From<ImageInfo> for Window {
    fn from(image: ImageInfo) -> Self {
        Window {
            begin: image.base,
            end: image.end(),
        }
    }
}

/// Anything the scanner can search for
pub trait Signature {
    fn pattern(&self) -> &[u8];
}

/// Start of the routine and the length of the window it executes in
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RoutineSignature {
    #[serde(deserialize_with = "pattern")]
    pub pattern: Vec<u8>,
    #[serde(deserialize_with = "number")]
    pub size: u64,
}

/// Code referencing the request record, with the position of the 32 bit relative operand
/// counted from the start of the match
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ReferenceSignature {
    #[serde(deserialize_with = "pattern")]
    pub pattern: Vec<u8>,
    #[serde(deserialize_with = "number")]
    pub operand_offset: u64,
}

impl Signature for RoutineSignature {
    fn pattern(&self) -> &[u8] {
        &self.pattern
    }
}

impl Signature for ReferenceSignature {
    fn pattern(&self) -> &[u8] {
        &self.pattern
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SignatureCatalog {
    #[serde(default)]
    pub name: String,
    /// restricts all scans, the whole image when absent
    #[serde(default)]
    pub window: Option<Window>,
    /// in priority order
    pub routine: Vec<RoutineSignature>,
    /// in priority order
    pub request_reference: Vec<ReferenceSignature>,
}

impl SignatureCatalog {
    pub fn from_json(data: &[u8]) -> VaultResult<Self> {
        let catalog: SignatureCatalog = serde_json::from_slice(data)
            .map_err(|err| VaultError::MalformedCatalog(err.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> VaultResult<Self> {
        let data = std::fs::read(path)
            .map_err(|err| VaultError::FileError(format!("{}: {}", path.display(), err)))?;
        Self::from_json(&data)
    }

    pub fn scan_window(&self, image: ImageInfo) -> Window {
        self.window.unwrap_or_else(|| Window::from(image))
    }

    fn validate(&self) -> VaultResult<()> {
        let malformed = |reason: String| Err(VaultError::MalformedCatalog(reason));
        if self.routine.is_empty() || self.request_reference.is_empty() {
            return malformed(String::from(
                "routine and request_reference need at least one signature each",
            ));
        }
        if let Some(window) = self.window {
            if window.begin >= window.end {
                return malformed(format!(
                    "empty window {:#x}..{:#x}",
                    window.begin, window.end
                ));
            }
        }
        for (index, routine) in self.routine.iter().enumerate() {
            if routine.pattern.is_empty() || routine.size == 0 {
                return malformed(format!("routine signature {} is empty", index));
            }
        }
        for (index, reference) in self.request_reference.iter().enumerate() {
            let reach = reference.pattern.len() as u64 + LOOKAHEAD;
            if reference.pattern.is_empty() {
                return malformed(format!("request_reference signature {} is empty", index));
            }
            if reference.operand_offset.saturating_add(OPERAND_WIDTH) > reach {
                return malformed(format!(
                    "operand of request_reference signature {} at {:#x} lies past the lookahead",
                    index, reference.operand_offset
                ));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Plain(u64),
    Text(String),
}

fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Number::deserialize(deserializer)? {
        Number::Plain(value) => Ok(value),
        Number::Text(text) => {
            let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
                None => text.replace('_', "").parse::<u64>(),
            };
            parsed.map_err(|_| de::Error::custom(format!("invalid number `{}`", text)))
        }
    }
}

pub fn parse_pattern(text: &str) -> Option<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(digits).ok()
}

fn pattern<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_pattern(&text).ok_or_else(|| de::Error::custom(format!("invalid hex pattern `{}`", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "name": "fixture",
        "window": { "begin": "0x1c0000000", "end": 7784628224 },
        "routine": [ { "pattern": "4c 8b dc 49 89 4b 08", "size": "0x4e" } ],
        "request_reference": [
            { "pattern": "c68d4500190f", "operand_offset": 78 },
            { "pattern": "C6 45 00 19 0F B6 45", "operand_offset": "0x50" }
        ]
    }"#;

    #[test]
    fn parses_numbers_and_patterns() {
        let catalog = SignatureCatalog::from_json(CATALOG.as_bytes()).expect("catalog is valid");
        assert_eq!("fixture", catalog.name);
        assert_eq!(
            Some(Window {
                begin: 0x1_C000_0000,
                end: 0x1_D000_0000
            }),
            catalog.window
        );
        assert_eq!(
            vec![0x4C, 0x8B, 0xDC, 0x49, 0x89, 0x4B, 0x08],
            catalog.routine[0].pattern
        );
        assert_eq!(0x4E, catalog.routine[0].size);
        assert_eq!(2, catalog.request_reference.len());
        assert_eq!(78, catalog.request_reference[0].operand_offset);
        assert_eq!(0x50, catalog.request_reference[1].operand_offset);
        assert_eq!(
            vec![0xC6, 0x45, 0x00, 0x19, 0x0F, 0xB6, 0x45],
            catalog.request_reference[1].pattern
        );
    }

    #[test]
    fn window_defaults_to_image() {
        let catalog = SignatureCatalog::from_json(
            br#"{"routine": [{"pattern": "c3", "size": 1}],
                 "request_reference": [{"pattern": "90", "operand_offset": 1}]}"#,
        )
        .expect("catalog is valid");
        let image = ImageInfo {
            base: 0x1000,
            size: 0x200,
        };
        assert_eq!(
            Window {
                begin: 0x1000,
                end: 0x1200
            },
            catalog.scan_window(image)
        );
    }

    fn expect_malformed(json: &str) {
        match SignatureCatalog::from_json(json.as_bytes()) {
            Err(VaultError::MalformedCatalog(_)) => (),
            other => panic!("expected malformed catalog for {}, got {:?}", json, other),
        }
    }

    #[test]
    fn rejects_invalid_catalogs() {
        // odd number of hex digits
        expect_malformed(
            r#"{"routine": [{"pattern": "c", "size": 1}],
                "request_reference": [{"pattern": "90", "operand_offset": 1}]}"#,
        );
        // no fallback list at all
        expect_malformed(r#"{"routine": [{"pattern": "c3", "size": 1}], "request_reference": []}"#);
        // operand beyond pattern plus lookahead
        expect_malformed(
            r#"{"routine": [{"pattern": "c3", "size": 1}],
                "request_reference": [{"pattern": "90", "operand_offset": "0x100"}]}"#,
        );
        // empty window
        expect_malformed(
            r#"{"window": {"begin": 16, "end": 16},
                "routine": [{"pattern": "c3", "size": 1}],
                "request_reference": [{"pattern": "90", "operand_offset": 1}]}"#,
        );
    }

    #[test]
    fn operand_at_lookahead_edge_is_accepted() {
        // 1 byte pattern + 0x100 lookahead leaves room for an operand at 0xFD
        SignatureCatalog::from_json(
            br#"{"routine": [{"pattern": "c3", "size": 1}],
                 "request_reference": [{"pattern": "90", "operand_offset": "0xfd"}]}"#,
        )
        .expect("operand ends exactly at the lookahead bound");
    }
}
