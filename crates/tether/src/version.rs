//! Version information sent to the parent during registration.

/// Tether runtime version from Cargo.toml
pub const TETHER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Versions announced in the Hello body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Tether runtime version.
    pub runtime: &'static str,
    /// Version of the concrete sub-process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            runtime: TETHER_VERSION,
            process: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(mut self, version: impl Into<String>) -> Self {
        self.process = Some(version.into());
        self
    }

    /// Version string the parent should display for this process.
    pub fn process_version(&self) -> &str {
        self.process.as_deref().unwrap_or(self.runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_runtime_version() {
        let info = VersionInfo::new();
        assert_eq!(info.runtime, TETHER_VERSION);
        assert!(info.process.is_none());
        assert_eq!(info.process_version(), TETHER_VERSION);
    }

    #[test]
    fn process_version_overrides_runtime() {
        let info = VersionInfo::new().with_process("2.1.0");
        assert_eq!(info.process_version(), "2.1.0");
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            runtime: "0.1.0",
            process: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "runtime": "0.1.0"
        }
        "#);
    }
}
