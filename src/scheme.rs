use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Strict weight policy tolerance: profiles must sum to 100 within this.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeKind {
    Generic,
    K12,
    HigherEd,
}

impl SchemeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generic" => Some(Self::Generic),
            "k12" => Some(Self::K12),
            "higher_ed" => Some(Self::HigherEd),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::K12 => "k12",
            Self::HigherEd => "higher_ed",
        }
    }

    /// K-12 and higher-ed families report transmuted grades.
    pub fn requires_transmutation(self) -> bool {
        matches!(self, Self::K12 | Self::HigherEd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    HalfUp,
    Floor,
}

impl RoundingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "half_up" => Some(Self::HalfUp),
            "floor" => Some(Self::Floor),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HalfUp => "half_up",
            Self::Floor => "floor",
        }
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::HalfUp => (x + 0.5).floor(),
            Self::Floor => x.floor(),
        }
    }
}

/// What a lookup does when the raw grade falls below every table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BelowRangePolicy {
    Fail,
    PassThrough,
}

impl BelowRangePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fail" => Some(Self::Fail),
            "pass_through" => Some(Self::PassThrough),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::PassThrough => "pass_through",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDef {
    pub code: String,
    pub label: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct WeightProfile {
    pub name: String,
    pub is_default: bool,
    /// component code -> weight percent
    pub weights: HashMap<String, f64>,
}

impl WeightProfile {
    pub fn weight_sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn sums_to_100(&self) -> bool {
        (self.weight_sum() - 100.0).abs() <= WEIGHT_SUM_TOLERANCE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransmutationRow {
    pub input_grade: f64,
    pub output_grade: f64,
}

#[derive(Debug, Clone)]
pub struct TransmutationTable {
    pub table_id: String,
    pub below_range_policy: BelowRangePolicy,
    /// Sorted ascending by input_grade.
    pub rows: Vec<TransmutationRow>,
}

impl TransmutationTable {
    pub fn new(table_id: &str, policy: BelowRangePolicy, mut rows: Vec<TransmutationRow>) -> Self {
        rows.sort_by(|a, b| {
            a.input_grade
                .partial_cmp(&b.input_grade)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self {
            table_id: table_id.to_string(),
            below_range_policy: policy,
            rows,
        }
    }

    /// Closest-lower-bound match: the largest row whose input is <= `raw`.
    /// Returns None when `raw` sits below every row.
    pub fn lookup(&self, raw: f64) -> Option<TransmutationRow> {
        self.rows
            .iter()
            .rev()
            .find(|r| r.input_grade <= raw)
            .copied()
    }
}

/// Standard 75-100 table: each integer input maps one band up,
/// so 80-84 lands in 85-89 (82 -> 87), capped at 100.
pub fn standard_k12_rows() -> Vec<TransmutationRow> {
    (75..=100)
        .map(|i| TransmutationRow {
            input_grade: f64::from(i),
            output_grade: f64::from((i + 5).min(100)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(weights: &[(&str, f64)]) -> WeightProfile {
        WeightProfile {
            name: "default".to_string(),
            is_default: true,
            weights: weights
                .iter()
                .map(|(c, w)| (c.to_string(), *w))
                .collect(),
        }
    }

    #[test]
    fn weight_sum_strictness() {
        assert!(profile(&[("WW", 30.0), ("PT", 50.0), ("QA", 20.0)]).sums_to_100());
        assert!(!profile(&[("WW", 30.0), ("PT", 50.0), ("QA", 20.02)]).sums_to_100());
        assert!(!profile(&[("WW", 30.0), ("PT", 50.0), ("QA", 19.5)]).sums_to_100());
    }

    #[test]
    fn lookup_uses_closest_lower_bound() {
        let table = TransmutationTable::new(
            "t",
            BelowRangePolicy::Fail,
            vec![
                TransmutationRow {
                    input_grade: 75.0,
                    output_grade: 80.0,
                },
                TransmutationRow {
                    input_grade: 80.0,
                    output_grade: 85.0,
                },
                TransmutationRow {
                    input_grade: 85.0,
                    output_grade: 90.0,
                },
            ],
        );
        let hit = table.lookup(83.0).unwrap();
        assert_eq!(hit.input_grade, 80.0);
        assert_eq!(hit.output_grade, 85.0);

        let exact = table.lookup(85.0).unwrap();
        assert_eq!(exact.input_grade, 85.0);

        assert!(table.lookup(74.9).is_none());
    }

    #[test]
    fn standard_rows_map_82_to_87_and_cap_at_100() {
        let table = TransmutationTable::new("t", BelowRangePolicy::Fail, standard_k12_rows());
        assert_eq!(table.lookup(82.0).unwrap().output_grade, 87.0);
        assert_eq!(table.lookup(82.6).unwrap().output_grade, 87.0);
        assert_eq!(table.lookup(98.0).unwrap().output_grade, 100.0);
        assert_eq!(table.lookup(100.0).unwrap().output_grade, 100.0);
    }

    #[test]
    fn rounding_modes() {
        assert_eq!(RoundingMode::HalfUp.apply(82.5), 83.0);
        assert_eq!(RoundingMode::HalfUp.apply(82.49), 82.0);
        assert_eq!(RoundingMode::Floor.apply(82.9), 82.0);
    }
}
