//! Action descriptors.
//!
//! An [`Action`] names a unit of work for tracing and throttling. It never
//! influences what is computed or cached.

use kiln_core::ActionId;
use std::collections::BTreeMap;
use std::fmt;

/// Well-known label carrying the action name
pub const LABEL_ACTION: &str = "action";
/// Well-known label carrying the action category
pub const LABEL_CATEGORY: &str = "category";

/// Provenance and tracing descriptor for a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    name: String,
    category: Option<String>,
    args: Vec<(String, String)>,
    labels: BTreeMap<String, String>,
    level: u8,
}

impl Action {
    /// Create an action with a name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            args: Vec::new(),
            labels: BTreeMap::new(),
            level: 0,
        }
    }

    /// Set the category
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Attach an argument, recorded on the span
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.args.push((key.into(), value.to_string()));
        self
    }

    /// Attach a label, used to match throttle rules
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set verbosity: 0 is info, 1 is debug, anything higher is trace
    #[must_use]
    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    /// Same action under a derived name
    #[must_use]
    pub fn renamed(&self, rename: impl FnOnce(&str) -> String) -> Self {
        let mut action = self.clone();
        action.name = rename(&self.name);
        action
    }

    /// Action name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Action category
    #[must_use]
    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Recorded arguments
    #[must_use]
    pub fn args(&self) -> &[(String, String)] {
        &self.args
    }

    /// Verbosity level
    #[must_use]
    pub const fn level(&self) -> u8 {
        self.level
    }

    /// Labels used for throttling, including the well-known ones
    #[must_use]
    pub fn throttle_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels
            .entry(LABEL_ACTION.to_string())
            .or_insert_with(|| self.name.clone());
        if let Some(category) = &self.category {
            labels
                .entry(LABEL_CATEGORY.to_string())
                .or_insert_with(|| category.clone());
        }
        labels
    }

    /// Open a span for one phase of this action
    #[must_use]
    pub fn span(&self, id: ActionId, phase: &'static str) -> tracing::Span {
        let category = self.category.as_deref().unwrap_or("");
        match self.level {
            0 => tracing::info_span!(
                "action",
                phase,
                name = %self.name,
                id = %id,
                category,
                args = ?self.args
            ),
            1 => tracing::debug_span!(
                "action",
                phase,
                name = %self.name,
                id = %id,
                category,
                args = ?self.args
            ),
            _ => tracing::trace_span!(
                "action",
                phase,
                name = %self.name,
                id = %id,
                category,
                args = ?self.args
            ),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.category {
            Some(category) => write!(f, "{} ({})", self.name, category),
            None => f.write_str(&self.name),
        }
    }
}
