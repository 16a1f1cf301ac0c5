//! Run configuration for the import fixer.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EmulationBudget, FixerError, Result};
use crate::formats::pe::{BytePattern, DEFAULT_EXTENSION_SECTION};

/// Which emulator drives candidate resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorBackend {
    /// Built-in interpreter over iced-x86
    #[default]
    Lite,
    /// Unicorn engine (requires the `unicorn` feature)
    Unicorn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixerConfig {
    /// Section the protector virtualized import stubs into
    pub vmp_section: String,
    /// Section scanned for call sites
    pub code_section: String,
    /// Section appended to host new import data
    pub extension_section: String,
    /// Byte pattern locating candidate calls
    pub call_pattern: String,
    /// Bytes that, following a call, mark it as a plain 5-byte call
    pub filler_bytes: Vec<u8>,
    pub output_dir: PathBuf,
    pub output_suffix: String,
    /// Also write a JSON run report next to the output image
    pub write_report: bool,
    /// Demangle resolved export names in logs and the report
    pub demangle_exports: bool,
    pub emulator: EmulatorBackend,
    pub budget: EmulationBudget,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            vmp_section: ".vmp0".to_string(),
            code_section: ".text".to_string(),
            extension_section: DEFAULT_EXTENSION_SECTION.to_string(),
            call_pattern: "E8 ? ? ? ?".to_string(),
            filler_bytes: vec![0xCC, 0xC3],
            output_dir: PathBuf::from("dumps"),
            output_suffix: ".fixed".to_string(),
            write_report: false,
            demangle_exports: false,
            emulator: EmulatorBackend::Lite,
            budget: EmulationBudget::default(),
        }
    }
}

impl FixerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the engine cannot act on.
    pub fn validate(&self) -> Result<()> {
        for (field, name) in [
            ("vmp_section", &self.vmp_section),
            ("code_section", &self.code_section),
            ("extension_section", &self.extension_section),
        ] {
            if name.is_empty() || name.len() > 8 {
                return Err(FixerError::Config(format!(
                    "{field} must be 1 to 8 bytes, got {name:?}"
                )));
            }
        }
        if self.extension_section == self.vmp_section || self.extension_section == self.code_section
        {
            return Err(FixerError::Config(
                "extension_section must differ from the scanned sections".to_string(),
            ));
        }
        let pattern = BytePattern::parse(&self.call_pattern)
            .map_err(|e| FixerError::Config(format!("call_pattern: {e}")))?;
        if pattern.len() != 5 {
            return Err(FixerError::Config(format!(
                "call_pattern must describe a 5-byte call, got {} bytes",
                pattern.len()
            )));
        }
        if self.output_suffix.is_empty() {
            return Err(FixerError::Config("output_suffix is empty".to_string()));
        }
        if self.budget.max_instructions == 0 {
            return Err(FixerError::Config(
                "budget.max_instructions must be positive".to_string(),
            ));
        }
        if self.emulator == EmulatorBackend::Unicorn && !cfg!(feature = "unicorn") {
            return Err(FixerError::Config(
                "unicorn backend requested but the unicorn feature is disabled".to_string(),
            ));
        }
        Ok(())
    }

    /// `<output_dir>/<module file name><output_suffix>`
    pub fn output_path(&self, module_file_name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}{}", module_file_name, self.output_suffix))
    }

    pub fn is_filler(&self, byte: u8) -> bool {
        self.filler_bytes.contains(&byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_tool() {
        let config = FixerConfig::default();
        assert_eq!(config.vmp_section, ".vmp0");
        assert_eq!(config.call_pattern, "E8 ? ? ? ?");
        assert!(config.is_filler(0xCC) && config.is_filler(0xC3));
        assert_eq!(
            config.output_path("game.exe"),
            PathBuf::from("dumps").join("game.exe.fixed")
        );
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            FixerConfig::from_json_str(r#"{"vmp_section": ".vmp1", "budget": {"max_instructions": 50}}"#)
                .unwrap();
        assert_eq!(config.vmp_section, ".vmp1");
        assert_eq!(config.code_section, ".text");
        assert_eq!(config.budget.max_instructions, 50);
        assert_eq!(config.emulator, EmulatorBackend::Lite);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            FixerConfig::from_json_str(r#"{"extension_section": ".toolongname"}"#),
            Err(FixerError::Config(_))
        ));
        assert!(matches!(
            FixerConfig::from_json_str(r#"{"call_pattern": "E8 ?"}"#),
            Err(FixerError::Config(_))
        ));
        assert!(matches!(
            FixerConfig::from_json_str(r#"{"budget": {"max_instructions": 0}}"#),
            Err(FixerError::Config(_))
        ));
        assert!(matches!(
            FixerConfig::from_json_str("{not json"),
            Err(FixerError::Serialization(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmpfix.json");
        std::fs::write(&path, r#"{"write_report": true, "filler_bytes": [204]}"#).unwrap();
        let config = FixerConfig::from_json_file(&path).unwrap();
        assert!(config.write_report);
        assert!(!config.is_filler(0xC3));
    }
}
