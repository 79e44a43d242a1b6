//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to descendants after a cell changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Re-execute the changed cell and its descendants immediately.
    #[default]
    Autorun,
    /// Only mark descendants stale; run them when explicitly requested.
    Lazy,
}

/// Configuration for the [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Eager or lazy propagation of changes.
    pub run_mode: RunMode,

    /// Names starting with this marker are private to the cell that
    /// declares them.
    pub private_prefix: String,

    /// Worker threads used to dispatch one batch. `None` lets rayon decide.
    pub max_parallelism: Option<usize>,

    /// Cancel a running cell after this long.
    #[serde(with = "duration_ms")]
    pub cell_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Autorun,
            private_prefix: "_".to_string(),
            max_parallelism: None,
            cell_timeout: None,
        }
    }
}

impl SchedulerConfig {
    /// Config that runs descendants as soon as an ancestor changes.
    pub fn eager() -> Self {
        Self::default()
    }

    /// Config that defers descendants until they are explicitly run.
    pub fn lazy() -> Self {
        Self {
            run_mode: RunMode::Lazy,
            ..Self::default()
        }
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn with_private_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.private_prefix = prefix.into();
        self
    }

    pub fn with_max_parallelism(mut self, threads: usize) -> Self {
        self.max_parallelism = Some(threads.max(1));
        self
    }

    pub fn with_cell_timeout(mut self, timeout: Duration) -> Self {
        self.cell_timeout = Some(timeout);
        self
    }

    /// Whether descendants run right after an edit.
    pub fn is_eager(&self) -> bool {
        self.run_mode == RunMode::Autorun
    }
}

/// Serde adapter storing an optional duration as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_autorun() {
        let config = SchedulerConfig::default();
        assert!(config.is_eager());
        assert_eq!(config.private_prefix, "_");
        assert!(config.cell_timeout.is_none());
    }

    #[test]
    fn test_lazy_constructor() {
        assert_eq!(SchedulerConfig::lazy().run_mode, RunMode::Lazy);
        assert!(!SchedulerConfig::lazy().is_eager());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"run_mode": "lazy", "cell_timeout": 250}"#).unwrap();
        assert_eq!(config.run_mode, RunMode::Lazy);
        assert_eq!(config.cell_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.private_prefix, "_");
    }

    #[test]
    fn test_max_parallelism_floor() {
        let config = SchedulerConfig::default().with_max_parallelism(0);
        assert_eq!(config.max_parallelism, Some(1));
    }
}
