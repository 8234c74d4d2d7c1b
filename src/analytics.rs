/// Admin console analytics helpers
use serde::{Deserialize, Serialize};

/// Colour for an empty heatmap cell
pub const HEATMAP_EMPTY: &str = "#f5f5f5";

const HEATMAP_SCALE: [(f64, &str); 3] = [(0.25, "#c6dbef"), (0.5, "#6baed6"), (0.75, "#2171b5")];
const HEATMAP_DARKEST: &str = "#08306b";

/// Bucket colour for a request count relative to the busiest cell
pub fn heatmap_color(request_count: u64, max_requests: u64) -> &'static str {
    if request_count == 0 || max_requests == 0 {
        return HEATMAP_EMPTY;
    }

    let intensity = request_count as f64 / max_requests as f64;
    HEATMAP_SCALE
        .iter()
        .find(|(limit, _)| intensity <= *limit)
        .map(|(_, color)| *color)
        .unwrap_or(HEATMAP_DARKEST)
}

/// One weekday/hour cell of the usage heatmap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapCell {
    /// 0 = Monday
    pub day_of_week: u32,
    pub hour: u32,
    pub request_count: u64,
    pub color: String,
}

/// Spread `(day, hour, count)` buckets over a full 7x24 grid, Monday 00:00 first
///
/// Day 0 is Monday. Buckets outside the grid are ignored.
pub fn usage_heatmap(buckets: impl IntoIterator<Item = (u32, u32, u64)>) -> Vec<HeatmapCell> {
    let mut counts = [[0u64; 24]; 7];
    for (day, hour, count) in buckets {
        if let Some(cell) = counts.get_mut(day as usize).and_then(|h| h.get_mut(hour as usize)) {
            *cell += count;
        }
    }

    let max = counts.iter().flatten().copied().max().unwrap_or(0);

    let mut cells = Vec::with_capacity(7 * 24);
    for (day, hours) in counts.iter().enumerate() {
        for (hour, count) in hours.iter().enumerate() {
            cells.push(HeatmapCell {
                day_of_week: day as u32,
                hour: hour as u32,
                request_count: *count,
                color: heatmap_color(*count, max).to_string(),
            });
        }
    }
    cells
}

/// Named funnel stage with its count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStep {
    pub name: String,
    pub count: u64,
}

/// Funnel stage with its loss relative to the previous stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStepResult {
    pub name: String,
    pub count: u64,
    pub drop_off_percent: f64,
}

/// Drop-off of each step against the one before it
///
/// The first step, and any step after an empty one, reports `0.0`.
pub fn compute_funnel(steps: &[FunnelStep]) -> Vec<FunnelStepResult> {
    let mut previous: Option<u64> = None;
    steps
        .iter()
        .map(|step| {
            let drop_off_percent = match previous {
                Some(prev) if prev > 0 => (prev as f64 - step.count as f64) / prev as f64 * 100.0,
                _ => 0.0,
            };
            previous = Some(step.count);
            FunnelStepResult {
                name: step.name.clone(),
                count: step.count,
                drop_off_percent,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heatmap_color_buckets() {
        assert_eq!(heatmap_color(0, 100), HEATMAP_EMPTY);
        assert_eq!(heatmap_color(0, 0), HEATMAP_EMPTY);
        assert_eq!(heatmap_color(25, 100), "#c6dbef");
        assert_eq!(heatmap_color(26, 100), "#6baed6");
        assert_eq!(heatmap_color(75, 100), "#2171b5");
        assert_eq!(heatmap_color(100, 100), HEATMAP_DARKEST);
    }

    #[test]
    fn test_usage_heatmap_grid() {
        let cells = usage_heatmap([(0, 9, 2), (6, 23, 1), (7, 0, 50), (0, 24, 50)]);

        assert_eq!(cells.len(), 168);
        let busiest = &cells[9];
        assert_eq!((busiest.day_of_week, busiest.hour), (0, 9));
        assert_eq!(busiest.request_count, 2);
        assert_eq!(busiest.color, HEATMAP_DARKEST);

        let last = cells.last().unwrap();
        assert_eq!((last.day_of_week, last.hour, last.request_count), (6, 23, 1));
        assert_eq!(last.color, "#6baed6");
        assert_eq!(cells[0].color, HEATMAP_EMPTY);
    }

    #[test]
    fn test_funnel_drop_off() {
        let steps = vec![
            FunnelStep { name: "trial".into(), count: 200 },
            FunnelStep { name: "activated".into(), count: 150 },
            FunnelStep { name: "paid".into(), count: 30 },
        ];
        let result = compute_funnel(&steps);
        assert_eq!(result[0].drop_off_percent, 0.0);
        assert!((result[1].drop_off_percent - 25.0).abs() < 1e-9);
        assert!((result[2].drop_off_percent - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_funnel_after_empty_step() {
        let steps = vec![
            FunnelStep { name: "trial".into(), count: 0 },
            FunnelStep { name: "paid".into(), count: 0 },
        ];
        let result = compute_funnel(&steps);
        assert!(result.iter().all(|s| s.drop_off_percent == 0.0));
    }
}
