//! Engine and per-model settings.

/// Behavioral settings for instances and lookups.
///
/// A copy lives on the engine as the defaults; each schema may override
/// individual fields at definition time.
///
/// # Example
///
/// ```ignore
/// let settings = Settings::new()
///     .identity_cache(true)
///     .auto_fetch(true)
///     .auto_fetch_limit(1);
/// ```
#[derive(Debug, Clone)]
pub struct Settings {
    /// Share one live instance per logical row
    pub identity_cache: bool,
    /// Bypass cached entries that carry unsaved changes
    pub identity_cache_save_check: bool,
    /// Resolve associations automatically after construction
    pub auto_fetch: bool,
    /// Association resolution depth for auto-fetch
    pub auto_fetch_limit: u32,
    /// Persist single-property changes immediately on set
    pub auto_save: bool,
    /// Remove dependent rows when the owner is removed
    pub cascade_remove: bool,
    /// Collect every validation failure instead of stopping at the first
    pub return_all_errors: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            identity_cache: true,
            identity_cache_save_check: true,
            auto_fetch: false,
            auto_fetch_limit: 2,
            auto_save: false,
            cascade_remove: true,
            return_all_errors: false,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn identity_cache(mut self, enabled: bool) -> Self {
        self.identity_cache = enabled;
        self
    }

    #[must_use]
    pub const fn identity_cache_save_check(mut self, enabled: bool) -> Self {
        self.identity_cache_save_check = enabled;
        self
    }

    #[must_use]
    pub const fn auto_fetch(mut self, enabled: bool) -> Self {
        self.auto_fetch = enabled;
        self
    }

    #[must_use]
    pub const fn auto_fetch_limit(mut self, limit: u32) -> Self {
        self.auto_fetch_limit = limit;
        self
    }

    #[must_use]
    pub const fn auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }

    #[must_use]
    pub const fn cascade_remove(mut self, enabled: bool) -> Self {
        self.cascade_remove = enabled;
        self
    }

    #[must_use]
    pub const fn return_all_errors(mut self, enabled: bool) -> Self {
        self.return_all_errors = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.identity_cache);
        assert!(settings.identity_cache_save_check);
        assert!(!settings.auto_fetch);
        assert_eq!(settings.auto_fetch_limit, 2);
        assert!(!settings.auto_save);
        assert!(settings.cascade_remove);
        assert!(!settings.return_all_errors);
    }

    #[test]
    fn test_builder_overrides() {
        let settings = Settings::new()
            .identity_cache(false)
            .auto_fetch(true)
            .auto_fetch_limit(1)
            .return_all_errors(true);

        assert!(!settings.identity_cache);
        assert!(settings.auto_fetch);
        assert_eq!(settings.auto_fetch_limit, 1);
        assert!(settings.return_all_errors);
    }
}
