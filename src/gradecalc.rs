use serde::Serialize;
use std::collections::HashMap;

use crate::scheme::{
    BelowRangePolicy, ComponentDef, RoundingMode, SchemeKind, TransmutationTable, WeightProfile,
};

/// One graded item's score for one student.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreState {
    /// Counts at face value toward raw, max_points toward max.
    Present(f64),
    /// Counts 0 toward raw, max_points toward max.
    Missing,
    /// Excluded from both raw and max.
    Excused,
}

#[derive(Debug, Clone, Copy)]
pub struct ItemScore {
    pub max_points: f64,
    pub state: ScoreState,
}

#[derive(Debug, Clone)]
pub struct StudentScores {
    pub student_id: String,
    pub display_name: String,
    /// component code -> scores for that component's items
    pub by_component: HashMap<String, Vec<ItemScore>>,
}

#[derive(Debug, Clone)]
pub struct EngineScheme {
    pub scheme_id: String,
    pub version: i64,
    pub kind: SchemeKind,
    pub rounding: RoundingMode,
    pub components: Vec<ComponentDef>,
    pub profiles: Vec<WeightProfile>,
}

impl EngineScheme {
    fn select_profile(&self, name: Option<&str>) -> Result<&WeightProfile, EngineError> {
        match name {
            Some(n) => self
                .profiles
                .iter()
                .find(|p| p.name == n)
                .ok_or_else(|| EngineError::new("missing_weight", format!("weight profile '{}' not found", n))),
            None => self
                .profiles
                .iter()
                .find(|p| p.is_default)
                .ok_or_else(|| EngineError::new("no_default_profile", "scheme has no default weight profile")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
}

impl EngineError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBreakdown {
    pub code: String,
    pub label: String,
    pub raw_total: f64,
    pub max_total: f64,
    pub percent: f64,
    pub weight_percent: f64,
    pub weighted_score: f64,
    pub present_count: usize,
    pub missing_count: usize,
    pub excused_count: usize,
}

/// Persisted per computed grade for audit display. Tagged by scheme
/// version so downstream consumers have a stable contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBreakdown {
    pub scheme_version: i64,
    pub initial_grade_raw: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_table_key: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmuted_grade: Option<f64>,
    pub final_grade: f64,
    pub rounding: RoundingMode,
    pub weight_policy: String,
    pub total_weight_applied: f64,
    pub components: Vec<ComponentBreakdown>,
    pub computed_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedGrade {
    pub student_id: String,
    pub display_name: String,
    pub initial_grade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmuted_grade: Option<f64>,
    pub final_grade: f64,
    pub breakdown: GradeBreakdown,
}

/// Weighted-average grade computation across a scheme's components.
///
/// Strict weight policy throughout: the selected profile must sum to 100,
/// and every component that has at least one eligible (non-excused) item
/// must have a resolvable weight. Components with zero eligible items are
/// excluded from the weight denominator, and the raw result is never
/// rescaled when the applied weight falls short of 100.
pub fn compute_grades(
    scheme: &EngineScheme,
    profile_name: Option<&str>,
    table: Option<&TransmutationTable>,
    students: &[StudentScores],
    computed_at: &str,
) -> Result<Vec<ComputedGrade>, EngineError> {
    let profile = scheme.select_profile(profile_name)?;
    if !profile.sums_to_100() {
        return Err(EngineError::new(
            "weights_not_100",
            format!(
                "weight profile '{}' sums to {:.2}, expected 100.00",
                profile.name,
                profile.weight_sum()
            ),
        ));
    }

    if scheme.kind.requires_transmutation() && table.is_none() {
        return Err(EngineError::new(
            "missing_transmutation_table",
            format!("scheme kind '{}' requires a transmutation table", scheme.kind.as_str()),
        ));
    }

    let mut out: Vec<ComputedGrade> = Vec::with_capacity(students.len());
    let empty: Vec<ItemScore> = Vec::new();

    for student in students {
        let mut components: Vec<ComponentBreakdown> = Vec::with_capacity(scheme.components.len());
        let mut initial_grade_raw = 0.0_f64;
        let mut total_weight = 0.0_f64;

        for comp in &scheme.components {
            let items = student.by_component.get(&comp.code).unwrap_or(&empty);

            let mut raw_total = 0.0_f64;
            let mut max_total = 0.0_f64;
            let mut present_count = 0_usize;
            let mut missing_count = 0_usize;
            let mut excused_count = 0_usize;

            for item in items {
                match item.state {
                    ScoreState::Present(v) => {
                        present_count += 1;
                        raw_total += v;
                        max_total += item.max_points;
                    }
                    ScoreState::Missing => {
                        missing_count += 1;
                        max_total += item.max_points;
                    }
                    ScoreState::Excused => {
                        excused_count += 1;
                    }
                }
            }

            let eligible = present_count + missing_count > 0;
            let percent = if max_total > 0.0 {
                100.0 * raw_total / max_total
            } else {
                0.0
            };

            let weight_percent = match profile.weights.get(&comp.code) {
                Some(w) => *w,
                None if eligible => {
                    return Err(EngineError::new(
                        "missing_weight",
                        format!(
                            "component '{}' has no weight in profile '{}'",
                            comp.code, profile.name
                        ),
                    ));
                }
                None => 0.0,
            };

            let weighted_score = if eligible {
                percent * weight_percent / 100.0
            } else {
                0.0
            };

            if eligible {
                initial_grade_raw += weighted_score;
                total_weight += weight_percent;
            }

            components.push(ComponentBreakdown {
                code: comp.code.clone(),
                label: comp.label.clone(),
                raw_total,
                max_total,
                percent,
                weight_percent,
                weighted_score,
                present_count,
                missing_count,
                excused_count,
            });
        }

        let (matched_table_key, transmuted_grade) = if scheme.kind.requires_transmutation() {
            // Checked Some above.
            let Some(table) = table else {
                return Err(EngineError::new(
                    "missing_transmutation_table",
                    "transmutation table required",
                ));
            };
            match table.lookup(initial_grade_raw) {
                Some(row) => (Some(row.input_grade), Some(row.output_grade)),
                None => match table.below_range_policy {
                    BelowRangePolicy::Fail => {
                        return Err(EngineError::new(
                            "below_table_range",
                            format!(
                                "raw grade {:.2} for student {} falls below the lowest table row",
                                initial_grade_raw, student.student_id
                            ),
                        ));
                    }
                    BelowRangePolicy::PassThrough => (None, None),
                },
            }
        } else {
            (None, None)
        };

        let final_grade = scheme
            .rounding
            .apply(transmuted_grade.unwrap_or(initial_grade_raw));

        out.push(ComputedGrade {
            student_id: student.student_id.clone(),
            display_name: student.display_name.clone(),
            initial_grade: initial_grade_raw,
            transmuted_grade,
            final_grade,
            breakdown: GradeBreakdown {
                scheme_version: scheme.version,
                initial_grade_raw,
                matched_table_key,
                transmuted_grade,
                final_grade,
                rounding: scheme.rounding,
                weight_policy: "strict".to_string(),
                total_weight_applied: total_weight,
                components,
                computed_at: computed_at.to_string(),
            },
        });
    }

    Ok(out)
}
