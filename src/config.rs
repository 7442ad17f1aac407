//! Analysis configuration
//!
//! This module provides the knobs that trade precision of the abstract
//! interpretation against the amount of control flow it models.

/// Configuration for a single abstract interpretation run
///
/// The defaults model every control-flow edge the block/exception structure
/// implies and specialize branches whose outcome is known from the abstract
/// value alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Treat a conditional branch on a value with known truthiness (e.g. `None`)
    /// as having a single successor, skipping analysis of the untaken edge
    pub specialize_known_branches: bool,

    /// Add an error edge from every instruction that can raise to the nearest
    /// enclosing handler. When disabled only the handler entry edge recorded at
    /// `SETUP_EXCEPT` / `SETUP_FINALLY` reaches the handler
    pub model_error_edges: bool,

    /// Maximum number of worklist pops before the analysis gives up (default: 1,000,000)
    pub max_iterations: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            specialize_known_branches: true,
            model_error_edges: true,
            max_iterations: 1_000_000,
        }
    }
}

impl AnalysisConfig {
    /// Creates a configuration that models the least control flow
    ///
    /// Branches are never specialized and only handler entry edges reach
    /// exception handlers. Useful for fast first-tier compilation.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            specialize_known_branches: false,
            model_error_edges: false,
            max_iterations: 1_000_000,
        }
    }

    /// Creates a configuration with every edge modelled and a tight iteration guard
    #[must_use]
    pub fn strict() -> Self {
        Self {
            specialize_known_branches: true,
            model_error_edges: true,
            max_iterations: 100_000,
        }
    }
}
