//! UNS path normalisation.
//!
//! Topics, edge nodes, Sparkplug devices, and metric names map
//! deterministically to slash-separated UNS paths; the dot-separated
//! historian tag id is a pure function of the slash path. These functions
//! carry no runtime dependencies so they can be exercised in isolation.

use crate::error::{Error, Result};

/// Split a raw value into path segments using forward slashes only.
///
/// Sparkplug names commonly embed hierarchy using `/` (e.g.
/// `"Area/Equipment/Metric"`). Other delimiters are left for the
/// normalisation pass to sanitise rather than being treated as separators.
fn split_segments(value: &str) -> impl Iterator<Item = &str> {
    value.trim().split('/').filter(|segment| !segment.is_empty())
}

/// Produce a sanitised path segment.
///
/// Surrounding whitespace is trimmed, interior whitespace runs collapse to a
/// single underscore, and characters outside the permitted set are replaced
/// with `_`. Runs of underscores or dashes collapse; casing is preserved.
fn normalize_segment(segment: &str) -> String {
    let mut cleaned = String::with_capacity(segment.len());
    let mut last_was_space = false;
    for ch in segment.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                cleaned.push('_');
                last_was_space = true;
            }
            continue;
        }
        last_was_space = false;
        if ch.is_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            cleaned.push(ch);
        } else {
            cleaned.push('_');
        }
    }

    let cleaned = collapse_runs(&cleaned, '_');
    let cleaned = collapse_runs(&cleaned, '-');
    cleaned.trim_matches(|c| c == '_' || c == '-' || c == ' ').to_string()
}

fn collapse_runs(value: &str, target: char) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last = None;
    for ch in value.chars() {
        if ch == target && last == Some(target) {
            continue;
        }
        out.push(ch);
        last = Some(ch);
    }
    out
}

fn normalized_segments<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    values
        .into_iter()
        .flat_map(split_segments)
        .map(normalize_segment)
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Compute the canonical UNS path for a device context.
///
/// `device` is present for DBIRTH frames and absent for NBIRTH frames.
pub fn normalize_device_path(group: &str, edge_node: &str, device: Option<&str>) -> Result<String> {
    if group.trim().is_empty() {
        return Err(Error::invalid_path("group is required for UNS device path"));
    }
    if edge_node.trim().is_empty() {
        return Err(Error::invalid_path(
            "edge_node is required for UNS device path",
        ));
    }

    let mut inputs = vec![group, edge_node];
    if let Some(device) = device {
        inputs.push(device);
    }
    let segments = normalized_segments(inputs);
    if segments.is_empty() {
        return Err(Error::invalid_path(
            "unable to derive any segments for UNS device path",
        ));
    }
    Ok(segments.join("/"))
}

/// Compute the canonical UNS path for a metric.
///
/// The metric path prefixes the device path and appends the metric name
/// split on `/` per Sparkplug conventions.
pub fn normalize_metric_path(
    group: &str,
    edge_node: &str,
    device: Option<&str>,
    metric_name: &str,
) -> Result<String> {
    if metric_name.trim().is_empty() {
        return Err(Error::invalid_path(
            "metric_name is required for UNS metric path",
        ));
    }

    let device_path = normalize_device_path(group, edge_node, device)?;
    let metric_segments = normalized_segments([metric_name]);
    if metric_segments.is_empty() {
        return Err(Error::invalid_path(
            "metric_name did not yield any path segments",
        ));
    }

    Ok(format!("{device_path}/{}", metric_segments.join("/")))
}

/// Translate a UNS metric path into the dot-separated historian tag id.
///
/// This is a pure function of the path: every `/` becomes `.`, nothing else
/// changes. The store enforces the same rule through a generated column.
pub fn to_canary_id(metric_path: &str) -> Result<String> {
    let trimmed = metric_path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::invalid_path("metric path must not be empty"));
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    for segment in &segments {
        if segment.trim().is_empty() {
            return Err(Error::invalid_path(format!(
                "metric path '{metric_path}' contains an empty segment"
            )));
        }
    }
    Ok(segments.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_joins_normalized_segments() {
        let path = normalize_device_path("Secil", "EdgeA", Some("DeviceA")).unwrap();
        assert_eq!(path, "Secil/EdgeA/DeviceA");
    }

    #[test]
    fn nbirth_omits_device_segment() {
        let path = normalize_device_path("Secil", "EdgeA", None).unwrap();
        assert_eq!(path, "Secil/EdgeA");
    }

    #[test]
    fn whitespace_collapses_to_single_underscore() {
        let path = normalize_device_path("Secil", "Edge  Node", Some(" Kiln 1 ")).unwrap();
        assert_eq!(path, "Secil/Edge_Node/Kiln_1");
    }

    #[test]
    fn disallowed_characters_become_underscores() {
        let path = normalize_metric_path("Secil", "EdgeA", Some("DeviceA"), "Temp#PV?").unwrap();
        assert_eq!(path, "Secil/EdgeA/DeviceA/Temp_PV_");

        // Runs collapse instead of stacking.
        let path = normalize_metric_path("Secil", "EdgeA", Some("DeviceA"), "A***B").unwrap();
        assert_eq!(path, "Secil/EdgeA/DeviceA/A_B");
    }

    #[test]
    fn metric_name_expands_embedded_hierarchy() {
        let path =
            normalize_metric_path("Secil", "EdgeA", Some("DeviceA"), "Temperature/PV").unwrap();
        assert_eq!(path, "Secil/EdgeA/DeviceA/Temperature/PV");
    }

    #[test]
    fn empty_segments_are_rejected() {
        assert!(normalize_device_path("", "EdgeA", None).is_err());
        assert!(normalize_device_path("Secil", "  ", None).is_err());
        assert!(normalize_metric_path("Secil", "EdgeA", None, "///").is_err());
        // A name that sanitises to nothing is rejected too.
        assert!(normalize_metric_path("Secil", "EdgeA", None, "***").is_err());
    }

    #[test]
    fn canary_id_is_slash_to_dot() {
        let id = to_canary_id("Secil/EdgeA/DeviceA/Temperature/PV").unwrap();
        assert_eq!(id, "Secil.EdgeA.DeviceA.Temperature.PV");
    }

    #[test]
    fn canary_id_is_stable_under_repeated_application() {
        let path = normalize_metric_path("Secil", "Edge A", Some("D#1"), "T/PV").unwrap();
        let once = to_canary_id(&path).unwrap();
        // Re-normalising an already-normal path is the identity.
        let again = normalize_metric_path("Secil", "Edge_A", Some("D_1"), "T/PV").unwrap();
        assert_eq!(path, again);
        assert_eq!(once, to_canary_id(&again).unwrap());
    }

    #[test]
    fn canary_id_rejects_blank_input() {
        assert!(to_canary_id("").is_err());
        assert!(to_canary_id("   ").is_err());
    }

    #[test]
    fn unicode_letters_are_preserved() {
        let path = normalize_device_path("Secil", "Área", Some("Fábrica")).unwrap();
        assert_eq!(path, "Secil/Área/Fábrica");
    }
}
