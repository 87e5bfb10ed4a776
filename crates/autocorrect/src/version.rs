//! Version information for the service.

/// Crate version from Cargo.toml
pub const AUTOCORRECT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub autocorrect: &'static str,
    /// Program the suggestion process was started from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            autocorrect: AUTOCORRECT_VERSION,
            program: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.autocorrect, AUTOCORRECT_VERSION);
        assert!(info.program.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            autocorrect: "0.1.0",
            program: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "autocorrect": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_program() {
        let info = VersionInfo {
            autocorrect: "0.1.0",
            program: None,
        }
        .with_program("python");
        insta::assert_json_snapshot!(info, @r#"
        {
          "autocorrect": "0.1.0",
          "program": "python"
        }
        "#);
    }
}
