//! Engine configuration, fixed at construction.

/// Namespace prefixes never rewritten: platform and host-infrastructure
/// units where marker calls cannot occur and analysis time is wasted.
pub const DEFAULT_EXCLUSIONS: &[&str] = &["core/", "std/", "sys/", "host/"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOptions {
    /// Render each rewritten unit's disassembly to the diagnostic log.
    pub trace: bool,
    /// Unit-name prefixes to skip entirely.
    pub exclude: Vec<String>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            trace: false,
            exclude: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RewriteOptions {
    pub fn is_excluded(&self, unit_name: &str) -> bool {
        self.exclude.iter().any(|p| unit_name.starts_with(p))
    }
}
