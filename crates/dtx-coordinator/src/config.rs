use std::time::Duration;

use dtx_core::BackendKind;
use serde::Deserialize;

/// Coordinator settings.
///
/// Both timeouts are off by default: edits and commits wait as long as the
/// backend takes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Deadline for one edit (read of the prior value plus the write).
    pub edit_timeout_ms: Option<u64>,

    /// Deadline for one participant's commit.
    pub submit_timeout_ms: Option<u64>,

    /// Backend kind used by `new_transaction` and the `*_default` edit calls.
    pub default_kind: BackendKind,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            edit_timeout_ms: None,
            submit_timeout_ms: None,
            default_kind: BackendKind::Remote,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_edit_timeout(mut self, timeout: Duration) -> Self {
        self.edit_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_default_kind(mut self, kind: BackendKind) -> Self {
        self.default_kind = kind;
        self
    }

    pub fn edit_timeout(&self) -> Option<Duration> {
        self.edit_timeout_ms.map(Duration::from_millis)
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.edit_timeout(), None);
        assert_eq!(config.submit_timeout(), None);
        assert_eq!(config.default_kind, BackendKind::Remote);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"submit_timeout_ms": 250, "default_kind": "local"}"#).unwrap();
        assert_eq!(config.edit_timeout(), None);
        assert_eq!(config.submit_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.default_kind, BackendKind::Local);
    }

    #[test]
    fn test_builders() {
        let config = CoordinatorConfig::default()
            .with_edit_timeout(Duration::from_secs(2))
            .with_default_kind(BackendKind::Local);
        assert_eq!(config.edit_timeout_ms, Some(2000));
        assert_eq!(config.default_kind, BackendKind::Local);
    }
}
