use std::env;

use log::warn;

use crate::constants::{INITIAL_MARK_STACK_SIZE, MAX_MARK_STACK_SIZE};

/// Optional overrides, anything left `None` takes the `GcConfig` default
#[derive(Debug, Default, Clone)]
pub struct CollectorCreateInfo {
    pub markers: Option<usize>,
    pub incremental: Option<bool>,
    pub interior_pointers: Option<bool>,
    pub find_leak: Option<bool>,
    pub abort_on_leak: Option<bool>,
    pub nearly_full_fraction: Option<f64>,
    pub release_empty_blocks: Option<bool>,
    pub initial_mark_stack_size: Option<usize>,
    pub max_mark_stack_size: Option<usize>,
}

impl CollectorCreateInfo {
    /// Overrides taken from `MARKSWEEP_*` environment variables
    pub fn from_env() -> CollectorCreateInfo {
        CollectorCreateInfo::from_lookup(|name| env::var(name).ok())
    }

    /// Overrides taken from any name to value lookup. Values that don't parse
    /// are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> CollectorCreateInfo
    where
        F: Fn(&str) -> Option<String>,
    {
        CollectorCreateInfo {
            markers: parse_var(&lookup, "MARKSWEEP_MARKERS", |v| v.parse().ok()),
            incremental: parse_var(&lookup, "MARKSWEEP_INCREMENTAL", parse_bool),
            interior_pointers: parse_var(&lookup, "MARKSWEEP_INTERIOR_POINTERS", parse_bool),
            find_leak: parse_var(&lookup, "MARKSWEEP_FIND_LEAK", parse_bool),
            abort_on_leak: parse_var(&lookup, "MARKSWEEP_ABORT_ON_LEAK", parse_bool),
            nearly_full_fraction: parse_var(&lookup, "MARKSWEEP_NEARLY_FULL", |v| v.parse().ok()),
            ..CollectorCreateInfo::default()
        }
    }
}

fn parse_var<F, T, P>(lookup: &F, name: &str, parse: P) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let value = lookup(name)?;
    let parsed = parse(value.trim());
    if parsed.is_none() {
        warn!("Ignoring {}={:?}: can't parse value", name, value);
    }
    parsed
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Resolved collector settings
#[derive(Debug, Clone, PartialEq)]
pub struct GcConfig {
    /// Threads taking part in marking, the collecting thread included
    pub markers: usize,
    /// Run the dirty block rescue pass before finishing a cycle
    pub incremental: bool,
    /// Accept pointers to the inside of objects, not just their base
    pub interior_pointers: bool,
    /// Collections report unreachable objects instead of freeing them
    pub find_leak: bool,
    pub abort_on_leak: bool,
    /// Blocks with more than this fraction of their slots marked are not
    /// worth reclaiming from until the next cycle
    pub nearly_full_fraction: f64,
    pub release_empty_blocks: bool,
    pub initial_mark_stack_size: usize,
    pub max_mark_stack_size: usize,
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig {
            markers: 1,
            incremental: false,
            interior_pointers: false,
            find_leak: false,
            abort_on_leak: false,
            nearly_full_fraction: 0.875,
            release_empty_blocks: true,
            initial_mark_stack_size: INITIAL_MARK_STACK_SIZE,
            max_mark_stack_size: MAX_MARK_STACK_SIZE,
        }
    }
}

impl GcConfig {
    pub fn from_info(info: &CollectorCreateInfo) -> GcConfig {
        let mut config = GcConfig::default();
        info.markers.inspect(|&val| config.markers = val);
        info.incremental.inspect(|&val| config.incremental = val);
        info.interior_pointers.inspect(|&val| config.interior_pointers = val);
        info.find_leak.inspect(|&val| config.find_leak = val);
        info.abort_on_leak.inspect(|&val| config.abort_on_leak = val);
        info.nearly_full_fraction
            .inspect(|&val| config.nearly_full_fraction = val);
        info.release_empty_blocks
            .inspect(|&val| config.release_empty_blocks = val);
        info.initial_mark_stack_size
            .inspect(|&val| config.initial_mark_stack_size = val);
        info.max_mark_stack_size
            .inspect(|&val| config.max_mark_stack_size = val);
        config.normalized()
    }

    /// Defaults with `MARKSWEEP_*` environment overrides applied
    pub fn from_env() -> GcConfig {
        GcConfig::from_info(&CollectorCreateInfo::from_env())
    }

    /// Clamp settings into their usable ranges
    pub fn normalized(mut self) -> GcConfig {
        self.markers = self.markers.max(1);
        if !(0.0..=1.0).contains(&self.nearly_full_fraction) {
            warn!(
                "nearly_full_fraction {} out of range, using {}",
                self.nearly_full_fraction,
                GcConfig::default().nearly_full_fraction
            );
            self.nearly_full_fraction = GcConfig::default().nearly_full_fraction;
        }
        self.initial_mark_stack_size = self.initial_mark_stack_size.max(2);
        self.max_mark_stack_size = self.max_mark_stack_size.max(self.initial_mark_stack_size);
        self
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use fnv::FnvHashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FnvHashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GcConfig::from_info(&CollectorCreateInfo::default());
        assert!(config == GcConfig::default());
        assert!(config.markers == 1);
        assert!(config.nearly_full_fraction == 0.875);
        assert!(config.release_empty_blocks);
    }

    #[test]
    fn test_overrides() {
        let info = CollectorCreateInfo {
            markers: Some(4),
            interior_pointers: Some(true),
            initial_mark_stack_size: Some(16),
            max_mark_stack_size: Some(8),
            ..CollectorCreateInfo::default()
        };
        let config = GcConfig::from_info(&info);

        assert!(config.markers == 4);
        assert!(config.interior_pointers);
        assert!(config.initial_mark_stack_size == 16);
        println!("test_overrides got {} expected {}", config.max_mark_stack_size, 16);
        assert!(config.max_mark_stack_size == 16);
    }

    #[test]
    fn test_env_lookup() {
        let info = CollectorCreateInfo::from_lookup(lookup(&[
            ("MARKSWEEP_MARKERS", "3"),
            ("MARKSWEEP_INCREMENTAL", "yes"),
            ("MARKSWEEP_FIND_LEAK", "0"),
            ("MARKSWEEP_NEARLY_FULL", "0.5"),
            ("MARKSWEEP_ABORT_ON_LEAK", "perhaps"),
        ]));

        assert!(info.markers == Some(3));
        assert!(info.incremental == Some(true));
        assert!(info.find_leak == Some(false));
        assert!(info.nearly_full_fraction == Some(0.5));
        assert!(info.abort_on_leak.is_none());
        assert!(info.interior_pointers.is_none());
    }

    #[test]
    fn test_normalize() {
        let info = CollectorCreateInfo {
            markers: Some(0),
            nearly_full_fraction: Some(1.5),
            ..CollectorCreateInfo::default()
        };
        let config = GcConfig::from_info(&info);
        assert!(config.markers == 1);
        assert!(config.nearly_full_fraction == 0.875);
    }
}
