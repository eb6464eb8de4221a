//! Matrix expansion.
//!
//! Expands a job's matrix axes into the cross-product of concrete points,
//! applying `exclude` filters and appending `include` points. Expansion is
//! deterministic: axis declaration order, then value order, so instance
//! naming is reproducible across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definition::types::{scalar_to_string, Matrix};

/// One concrete matrix point: axis -> value, in axis declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixPoint {
    pub values: Vec<(String, serde_json::Value)>,
}

impl MatrixPoint {
    /// Value for an axis, if present.
    pub fn get(&self, axis: &str) -> Option<&serde_json::Value> {
        self.values
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, v)| v)
    }

    /// Instance name suffix: `(v1, v2)`, empty for the no-matrix case.
    pub fn suffix(&self) -> String {
        if self.values.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(_, v)| scalar_to_string(v))
            .collect();
        format!(" ({})", parts.join(", "))
    }

    /// Stringified axis values, for environment injection and conditions.
    pub fn as_strings(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(axis, v)| (axis.clone(), scalar_to_string(v)))
            .collect()
    }
}

/// Expand a matrix into concrete points.
///
/// No matrix (or no axes) yields a single empty point.
pub fn expand(matrix: Option<&Matrix>) -> Vec<MatrixPoint> {
    let matrix = match matrix {
        Some(m) if !m.axes.is_empty() || !m.include.is_empty() => m,
        _ => return vec![MatrixPoint::default()],
    };

    let mut points = cross_product(&matrix.axes);

    points.retain(|point| !matrix.exclude.iter().any(|entry| excludes(entry, point)));

    for entry in &matrix.include {
        points.push(MatrixPoint {
            values: entry
                .iter()
                .map(|(axis, v)| (axis.clone(), v.clone()))
                .collect(),
        });
    }

    if points.is_empty() {
        // Every cross-product point was excluded and nothing was included.
        return vec![MatrixPoint::default()];
    }

    points
}

fn cross_product(axes: &[(String, Vec<serde_json::Value>)]) -> Vec<MatrixPoint> {
    if axes.is_empty() {
        return Vec::new();
    }

    let mut points = vec![MatrixPoint::default()];
    for (axis, values) in axes {
        let mut next = Vec::with_capacity(points.len() * values.len());
        for point in &points {
            for value in values {
                let mut extended = point.clone();
                extended.values.push((axis.clone(), value.clone()));
                next.push(extended);
            }
        }
        points = next;
    }
    points
}

/// An exclude entry removes a point when all of its axis values match.
/// Partial entries match every point sharing the listed values.
fn excludes(entry: &BTreeMap<String, serde_json::Value>, point: &MatrixPoint) -> bool {
    !entry.is_empty()
        && entry
            .iter()
            .all(|(axis, value)| point.get(axis) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(yaml: &str) -> Matrix {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_cross_product_order() {
        let m = matrix(
            r#"
os: [a, b]
version: [1, 2]
"#,
        );

        let points = expand(Some(&m));
        assert_eq!(points.len(), 4);

        let names: Vec<String> = points.iter().map(|p| p.suffix()).collect();
        assert_eq!(names[0], " (a, 1)");
        assert_eq!(names[1], " (a, 2)");
        assert_eq!(names[2], " (b, 1)");
        assert_eq!(names[3], " (b, 2)");
    }

    #[test]
    fn test_exclude_removes_point() {
        let m = matrix(
            r#"
os: [a, b]
version: [1, 2]
exclude:
  - os: a
    version: 2
"#,
        );

        let points = expand(Some(&m));
        assert_eq!(points.len(), 3);
        assert!(!points.iter().any(|p| p.suffix() == " (a, 2)"));
    }

    #[test]
    fn test_partial_exclude() {
        let m = matrix(
            r#"
os: [a, b]
version: [1, 2]
exclude:
  - os: b
"#,
        );

        let points = expand(Some(&m));
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.get("os") == Some(&serde_json::json!("a"))));
    }

    #[test]
    fn test_include_appended() {
        let m = matrix(
            r#"
os: [a]
include:
  - os: c
    experimental: true
"#,
        );

        let points = expand(Some(&m));
        assert_eq!(points.len(), 2);
        let last = &points[1];
        assert_eq!(last.get("os"), Some(&serde_json::json!("c")));
        assert_eq!(last.get("experimental"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn test_no_matrix_single_instance() {
        let points = expand(None);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].suffix(), "");
    }

    #[test]
    fn test_as_strings() {
        let m = matrix("os: [linux]\nversion: [\"1.75\"]\n");
        let points = expand(Some(&m));
        let strings = points[0].as_strings();
        assert_eq!(strings["os"], "linux");
        assert_eq!(strings["version"], "1.75");
    }
}
