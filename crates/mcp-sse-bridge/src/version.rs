//! Version information for the bridge.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported on the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub bridge: &'static str,
    /// Executable the bridge was started with, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            child: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_child(mut self, executable: String) -> Self {
        self.child = Some(executable);
        self
    }
}
