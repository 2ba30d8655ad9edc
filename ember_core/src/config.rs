//! Runtime and interpreter configuration.

use crate::error::{EmberError, EmberResult};

// =============================================================================
// Recursion Limit
// =============================================================================

/// Default per-thread recursion limit.
pub const DEFAULT_RECURSION_LIMIT: u32 = 1000;

/// Minimum allowed recursion limit.
pub const MIN_RECURSION_LIMIT: u32 = 1;

/// Maximum allowed recursion limit.
pub const MAX_RECURSION_LIMIT: u32 = 1_000_000;

fn check_recursion_limit(limit: u32) -> EmberResult<()> {
    if limit < MIN_RECURSION_LIMIT {
        return Err(EmberError::value_error(format!(
            "recursion limit must be at least {}",
            MIN_RECURSION_LIMIT
        )));
    }
    if limit > MAX_RECURSION_LIMIT {
        return Err(EmberError::value_error(format!(
            "recursion limit must be at most {}",
            MAX_RECURSION_LIMIT
        )));
    }
    Ok(())
}

// =============================================================================
// Interpreter Configuration
// =============================================================================

/// Per-interpreter configuration, fixed at interpreter creation.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    recursion_limit: u32,
    verbose: bool,
}

impl InterpreterConfig {
    /// Create with defaults.
    #[inline]
    pub fn new() -> Self {
        Self {
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            verbose: false,
        }
    }

    /// Set the recursion limit, validating the range.
    pub fn with_recursion_limit(mut self, limit: u32) -> EmberResult<Self> {
        check_recursion_limit(limit)?;
        self.recursion_limit = limit;
        Ok(self)
    }

    /// Enable verbose stderr diagnostics (e.g. during thread-state clear).
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    #[inline]
    pub fn recursion_limit(&self) -> u32 {
        self.recursion_limit
    }

    #[inline]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Process-level configuration for a runtime handle.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Configuration applied to the main interpreter created alongside the
    /// runtime.
    pub main_interpreter: InterpreterConfig,
}

impl RuntimeConfig {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = InterpreterConfig::new();
        assert_eq!(config.recursion_limit(), DEFAULT_RECURSION_LIMIT);
        assert!(!config.verbose());
    }

    #[test]
    fn test_config_with_recursion_limit() {
        let config = InterpreterConfig::new().with_recursion_limit(5).unwrap();
        assert_eq!(config.recursion_limit(), 5);
    }

    #[test]
    fn test_config_recursion_limit_too_low() {
        let result = InterpreterConfig::new().with_recursion_limit(0);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_recursion_limit_too_high() {
        let result = InterpreterConfig::new().with_recursion_limit(MAX_RECURSION_LIMIT + 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_recursion_limit_bounds() {
        assert!(InterpreterConfig::new()
            .with_recursion_limit(MIN_RECURSION_LIMIT)
            .is_ok());
        assert!(InterpreterConfig::new()
            .with_recursion_limit(MAX_RECURSION_LIMIT)
            .is_ok());
    }

    #[test]
    fn test_config_verbose() {
        let config = InterpreterConfig::new().with_verbose(true);
        assert!(config.verbose());
    }

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::new();
        assert_eq!(
            config.main_interpreter.recursion_limit(),
            DEFAULT_RECURSION_LIMIT
        );
    }
}
