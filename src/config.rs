//! Service configuration.

use std::path::{Path, PathBuf};

use crate::error::{BasaliskError, BasaliskResult};
use crate::matcher::CompileOptions;
use crate::storage::{LOCK_FILE, TEMP_MARKER};

/// Default fan-out address the service subscribes to.
pub const DEFAULT_SUBSCRIBE_ADDR: &str = "127.0.0.1:5555";

/// Default address the service pushes outbound messages to.
pub const DEFAULT_PUSH_ADDR: &str = "127.0.0.1:5556";

/// Default service name reported in status responses and invalidations.
pub const DEFAULT_SERVICE_NAME: &str = "basalisk";

/// Configuration for a Basalisk service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Name echoed in status responses and cache invalidations.
    pub service_name: String,
    /// Address of the publisher that fans scan/reconfigure/status requests out.
    pub subscribe_addr: String,
    /// Address that collects outbound notifications.
    pub push_addr: String,
    /// Directory holding the persisted matcher blob and expression list.
    pub state_dir: PathBuf,
    /// File name of the compiled matcher blob inside `state_dir`.
    pub matcher_file: String,
    /// File name of the newline-delimited expression list inside `state_dir`.
    pub expressions_file: String,
    /// Upper bound on the compiled size of the regex set (bytes).
    pub regex_size_limit: usize,
    /// Largest bus frame accepted or emitted (bytes).
    pub max_frame_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            subscribe_addr: DEFAULT_SUBSCRIBE_ADDR.to_string(),
            push_addr: DEFAULT_PUSH_ADDR.to_string(),
            state_dir: PathBuf::from("./basalisk-state"),
            matcher_file: "matcher.blob".to_string(),
            expressions_file: "expressions.txt".to_string(),
            regex_size_limit: 64 * 1024 * 1024, // 64 MiB
            max_frame_bytes: 16 * 1024 * 1024,  // 16 MiB
        }
    }
}

impl ServiceConfig {
    const MIN_REGEX_SIZE_LIMIT: usize = 1024 * 1024;
    const MIN_FRAME_BYTES: usize = 1024;

    /// Config rooted at `state_dir`, defaults elsewhere.
    #[must_use]
    pub fn with_state_dir(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Checks the configuration for values the service cannot run with.
    pub fn validate(self) -> BasaliskResult<Self> {
        if self.service_name.trim().is_empty() {
            return Err(BasaliskError::config("service_name cannot be empty"));
        }

        for (field, name) in [
            ("matcher_file", &self.matcher_file),
            ("expressions_file", &self.expressions_file),
        ] {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(BasaliskError::config(format!(
                    "{field} must be a plain file name (got {name:?})"
                )));
            }
            if matches!(name.as_str(), "." | ".." | LOCK_FILE) || name.contains(TEMP_MARKER) {
                return Err(BasaliskError::config(format!(
                    "{field} collides with a reserved state-directory name (got {name:?})"
                )));
            }
        }

        if self.matcher_file == self.expressions_file {
            return Err(BasaliskError::config(
                "matcher_file and expressions_file must differ",
            ));
        }

        if self.regex_size_limit < Self::MIN_REGEX_SIZE_LIMIT {
            return Err(BasaliskError::config(format!(
                "regex_size_limit must be at least {} bytes (got {})",
                Self::MIN_REGEX_SIZE_LIMIT,
                self.regex_size_limit
            )));
        }

        if self.max_frame_bytes < Self::MIN_FRAME_BYTES {
            return Err(BasaliskError::config(format!(
                "max_frame_bytes must be at least {} bytes (got {})",
                Self::MIN_FRAME_BYTES,
                self.max_frame_bytes
            )));
        }

        Ok(self)
    }

    /// Full path of the matcher blob.
    #[must_use]
    pub fn matcher_path(&self) -> PathBuf {
        self.state_dir.join(&self.matcher_file)
    }

    /// Full path of the expression list.
    #[must_use]
    pub fn expressions_path(&self) -> PathBuf {
        self.state_dir.join(&self.expressions_file)
    }

    #[must_use]
    pub const fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            size_limit: self.regex_size_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = ServiceConfig::default().validate().unwrap();
        assert_eq!(cfg.subscribe_addr, DEFAULT_SUBSCRIBE_ADDR);
        assert_eq!(cfg.push_addr, DEFAULT_PUSH_ADDR);
        assert_eq!(cfg.service_name, "basalisk");
    }

    #[test]
    fn test_rejects_empty_service_name() {
        let cfg = ServiceConfig {
            service_name: "  ".to_string(),
            ..ServiceConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_nested_file_name() {
        let cfg = ServiceConfig {
            matcher_file: "sub/matcher.blob".to_string(),
            ..ServiceConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("matcher_file"));
    }

    #[test]
    fn test_rejects_reserved_file_names() {
        for name in [".", "..", LOCK_FILE, "matcher.tmp.blob"] {
            let cfg = ServiceConfig {
                matcher_file: name.to_string(),
                ..ServiceConfig::default()
            };
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("reserved"), "{name:?} should be rejected");

            let cfg = ServiceConfig {
                expressions_file: name.to_string(),
                ..ServiceConfig::default()
            };
            assert!(cfg.validate().is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_rejects_shared_file_name() {
        let cfg = ServiceConfig {
            matcher_file: "state".to_string(),
            expressions_file: "state".to_string(),
            ..ServiceConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_limits() {
        let cfg = ServiceConfig {
            regex_size_limit: 10,
            ..ServiceConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ServiceConfig {
            max_frame_bytes: 10,
            ..ServiceConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_paths_join_state_dir() {
        let cfg = ServiceConfig::with_state_dir("/var/lib/basalisk");
        assert_eq!(cfg.matcher_path(), PathBuf::from("/var/lib/basalisk/matcher.blob"));
        assert_eq!(
            cfg.expressions_path(),
            PathBuf::from("/var/lib/basalisk/expressions.txt")
        );
    }
}
