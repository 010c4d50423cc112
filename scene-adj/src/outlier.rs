use scene_types::{ImagePointId, Project};

/// Thresholds below/above which the adaptive cutoff saturates.
const LOW_MEDIAN_CUTOFF: f64 = 20.0;
const MIN_THRESHOLD: f64 = 50.0;
const MAX_THRESHOLD: f64 = 80.0;

/// One observation rejected by the outlier pass.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutlierObservation {
    pub world_point_name: String,
    pub viewpoint_name: String,
    /// Reprojection distance in pixels at rejection time.
    pub error: f64,
}

/// Adaptive outlier threshold over the median reprojection magnitude `m`:
/// `max(k·m, 50)` for small medians, `min(k·m, 80)` otherwise.
pub fn outlier_threshold(median: f64, multiplier: f64) -> f64 {
    if median < LOW_MEDIAN_CUTOFF {
        (multiplier * median).max(MIN_THRESHOLD)
    } else {
        (multiplier * median).min(MAX_THRESHOLD)
    }
}

/// Median of reprojection magnitudes; `None` for an empty slice.
pub fn median_error(errors: &[f64]) -> Option<f64> {
    if errors.is_empty() {
        return None;
    }
    let mut sorted = errors.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    Some(if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) * 0.5
    } else {
        sorted[n / 2]
    })
}

/// Select observations whose error exceeds the adaptive threshold.
///
/// Input magnitudes must exclude behind-camera penalty rows; selection
/// preserves the caller's (deterministic) observation order.
pub fn select_outliers(
    errors: &[(ImagePointId, f64)],
    multiplier: f64,
) -> Vec<(ImagePointId, f64)> {
    let magnitudes: Vec<f64> = errors.iter().map(|(_, e)| *e).collect();
    let Some(median) = median_error(&magnitudes) else {
        return Vec::new();
    };
    let threshold = outlier_threshold(median, multiplier);
    errors
        .iter()
        .filter(|(_, e)| *e > threshold)
        .cloned()
        .collect()
}

/// Remove the selected observations from the project, reporting each by
/// world-point and viewpoint name.
pub fn remove_outliers(
    project: &mut Project,
    outliers: &[(ImagePointId, f64)],
) -> Vec<OutlierObservation> {
    let mut report = Vec::new();
    for &(id, error) in outliers {
        let Some(ip) = project.image_points.get(id) else {
            continue;
        };
        let world_point_name = project
            .world_points
            .get(ip.world_point)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let viewpoint_name = project
            .viewpoints
            .get(ip.viewpoint)
            .map(|v| v.name.clone())
            .unwrap_or_default();
        project.image_points.remove(id);
        report.push(OutlierObservation {
            world_point_name,
            viewpoint_name,
            error,
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn threshold_saturates_on_both_sides() {
        // small median: k·m below the floor
        assert_relative_eq!(outlier_threshold(1.0, 5.0), 50.0);
        // small median, k·m above the floor
        assert_relative_eq!(outlier_threshold(15.0, 5.0), 75.0);
        // large median: capped at 80
        assert_relative_eq!(outlier_threshold(30.0, 5.0), 80.0);
    }

    #[test]
    fn median_of_even_and_odd_sets() {
        assert_eq!(median_error(&[]), None);
        assert_relative_eq!(median_error(&[3.0]).unwrap(), 3.0);
        assert_relative_eq!(median_error(&[1.0, 3.0]).unwrap(), 2.0);
        assert_relative_eq!(median_error(&[5.0, 1.0, 3.0]).unwrap(), 3.0);
    }

    #[test]
    fn selection_keeps_inliers() {
        use scene_types::ImagePointId;
        let errors: Vec<(ImagePointId, f64)> = vec![
            (ImagePointId(0), 0.5),
            (ImagePointId(1), 0.8),
            (ImagePointId(2), 0.6),
            (ImagePointId(3), 400.0),
        ];
        let out = select_outliers(&errors, 5.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, ImagePointId(3));
    }
}
