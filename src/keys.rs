//! Cache key composition
//!
//! Keys are ordered parameter lists joined with [`DELIMITER`]. Absent
//! segments become empty strings, except where a fallback token keeps
//! "no value" apart from "empty value":
//!
//! - [`AGGREGATE_TOKEN`] when no configuration id applies
//! - [`RAW_TOKEN`] when no normalization reference applies
//!
//! Namespaced keys prefix the same join with a literal segment so that two
//! views over one parameter tuple occupy distinct cache slots.

use std::fmt::Display;

/// Segment delimiter
pub const DELIMITER: &str = "|";

/// Stands in for a missing configuration id (aggregated over configs)
pub const AGGREGATE_TOKEN: &str = "agg";

/// Stands in for a missing normalization reference (raw values)
pub const RAW_TOKEN: &str = "raw";

/// Namespace of the relevant-entities view
pub const RELEVANT_NAMESPACE: &str = "rel";

/// A value that can appear as one key segment
pub trait KeySegment {
    /// String form of the segment
    fn segment(&self) -> String;
}

macro_rules! display_segment {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KeySegment for $ty {
                fn segment(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

display_segment!(
    str, String, char, bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64,
);

impl<T: KeySegment + ?Sized> KeySegment for &T {
    fn segment(&self) -> String {
        (**self).segment()
    }
}

impl<T: KeySegment> KeySegment for Option<T> {
    fn segment(&self) -> String {
        self.as_ref().map(KeySegment::segment).unwrap_or_default()
    }
}

/// Join segments with the key delimiter.
///
/// ```
/// use forecast_cache::keys::compose_key;
///
/// assert_eq!(compose_key(&[&"a", &None::<&str>, &3]), "a||3");
/// ```
pub fn compose_key(parts: &[&dyn KeySegment]) -> String {
    parts
        .iter()
        .map(|part| part.segment())
        .collect::<Vec<_>>()
        .join(DELIMITER)
}

/// Join segments behind a literal namespace segment
pub fn namespaced_key(namespace: &str, parts: &[&dyn KeySegment]) -> String {
    let rest = compose_key(parts);
    if parts.is_empty() {
        namespace.to_string()
    } else {
        format!("{namespace}{DELIMITER}{rest}")
    }
}

fn or_token<T: Display>(value: Option<T>, token: &str) -> String {
    value.map_or_else(|| token.to_string(), |v| v.to_string())
}

/// Workspace metadata
pub fn workspace_key(workspace: &str) -> String {
    compose_key(&[&workspace])
}

/// Methods and configurations available for a forecast date
pub fn methods_key(workspace: &str, date: &str) -> String {
    compose_key(&[&workspace, &date])
}

/// All entities for a method/config
pub fn entities_key(workspace: &str, date: &str, method_id: &str, config_id: Option<&str>) -> String {
    compose_key(&[&workspace, &date, &method_id, &or_token(config_id, AGGREGATE_TOKEN)])
}

/// Only the entities relevant for a method/config, kept apart from [`entities_key`]
pub fn relevant_entities_key(
    workspace: &str,
    date: &str,
    method_id: &str,
    config_id: Option<&str>,
) -> String {
    namespaced_key(
        RELEVANT_NAMESPACE,
        &[&workspace, &date, &method_id, &or_token(config_id, AGGREGATE_TOKEN)],
    )
}

/// Forecast values at one lead time and percentile.
///
/// ```
/// use forecast_cache::keys::forecast_values_key;
///
/// assert_eq!(
///     forecast_values_key("ws", "2024-01-01", "m", None, 24, 50, None),
///     "ws|2024-01-01|m|agg|24|50|raw"
/// );
/// ```
pub fn forecast_values_key(
    workspace: &str,
    date: &str,
    method_id: &str,
    config_id: Option<&str>,
    lead_hours: i64,
    percentile: u8,
    normalize_ref: Option<&str>,
) -> String {
    compose_key(&[
        &workspace,
        &date,
        &method_id,
        &or_token(config_id, AGGREGATE_TOKEN),
        &lead_hours,
        &percentile,
        &or_token(normalize_ref, RAW_TOKEN),
    ])
}

/// Synthesis over all methods at one percentile
pub fn synthesis_key(
    workspace: &str,
    date: &str,
    percentile: u8,
    normalize_ref: Option<&str>,
) -> String {
    compose_key(&[&workspace, &date, &percentile, &or_token(normalize_ref, RAW_TOKEN)])
}

/// Analog dates selected for one entity and lead time
pub fn analog_dates_key(
    workspace: &str,
    date: &str,
    method_id: &str,
    config_id: Option<&str>,
    entity_id: i64,
    lead_hours: i64,
) -> String {
    compose_key(&[
        &workspace,
        &date,
        &method_id,
        &or_token(config_id, AGGREGATE_TOKEN),
        &entity_id,
        &lead_hours,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_compose_key_empty_segments() {
        assert_eq!(compose_key(&[&"a", &None::<&str>, &3]), "a||3");
        assert_eq!(compose_key(&[&Some("x"), &Some(1.5)]), "x|1.5");
        assert_eq!(compose_key(&[]), "");
    }

    #[test]
    fn test_forecast_values_key_fallback_tokens() {
        assert_eq!(
            forecast_values_key("ws", "2024-01-01", "m", None, 24, 50, None),
            "ws|2024-01-01|m|agg|24|50|raw"
        );
        assert_eq!(
            forecast_values_key("ws", "2024-01-01", "m", Some("c1"), 48, 90, Some("p10")),
            "ws|2024-01-01|m|c1|48|90|p10"
        );
    }

    #[test]
    fn test_fallback_tokens_do_not_collide_with_empty_strings() {
        let absent = entities_key("ws", "2024-01-01", "m", None);
        let empty = entities_key("ws", "2024-01-01", "m", Some(""));
        assert_ne!(absent, empty);
        assert_eq!(empty, "ws|2024-01-01|m|");
    }

    #[test]
    fn test_relevant_entities_use_distinct_slot() {
        let all = entities_key("ws", "2024-01-01_12", "m1", Some("c1"));
        let relevant = relevant_entities_key("ws", "2024-01-01_12", "m1", Some("c1"));
        assert_eq!(all, "ws|2024-01-01_12|m1|c1");
        assert_eq!(relevant, "rel|ws|2024-01-01_12|m1|c1");
    }

    #[test]
    fn test_namespaced_key_without_parts() {
        assert_eq!(namespaced_key("rel", &[]), "rel");
    }

    #[test]
    fn test_domain_keys_share_workspace_prefix() {
        let keys = [
            workspace_key("ws1"),
            methods_key("ws1", "2024-01-01"),
            synthesis_key("ws1", "2024-01-01", 50, None),
            analog_dates_key("ws1", "2024-01-01", "m", None, 7, 24),
        ];
        for key in &keys {
            assert!(key.starts_with("ws1"), "{key}");
        }
        assert_eq!(keys[3], "ws1|2024-01-01|m|agg|7|24");
    }
}
