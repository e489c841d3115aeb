use std::env;
use std::sync::OnceLock;

static FERROGRAPH_PASS_STATS: OnceLock<bool> = OnceLock::new();
static FERROGRAPH_PATTERN_MAX_ITERS: OnceLock<usize> = OnceLock::new();
static FERROGRAPH_HW_DEVICES: OnceLock<usize> = OnceLock::new();
static FERROGRAPH_LOG: OnceLock<Option<String>> = OnceLock::new();

const DEFAULT_PATTERN_MAX_ITERS: usize = 8;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub(crate) fn pass_stats_enabled() -> bool {
    *FERROGRAPH_PASS_STATS.get_or_init(|| match env::var("FERROGRAPH_PASS_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn pattern_max_iters() -> usize {
    *FERROGRAPH_PATTERN_MAX_ITERS.get_or_init(|| {
        parse_usize("FERROGRAPH_PATTERN_MAX_ITERS", DEFAULT_PATTERN_MAX_ITERS).max(1)
    })
}

/// Number of hardware devices the global device manager exposes.
pub(crate) fn hw_device_count() -> usize {
    *FERROGRAPH_HW_DEVICES.get_or_init(|| parse_usize("FERROGRAPH_HW_DEVICES", 0))
}

pub(crate) fn log_filter() -> Option<&'static str> {
    FERROGRAPH_LOG
        .get_or_init(|| match env::var("FERROGRAPH_LOG") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        })
        .as_deref()
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parses_truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
