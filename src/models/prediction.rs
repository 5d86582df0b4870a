//! Typed view over the aggregation result produced by the prediction service.
//!
//! Everything here is read-only: averages, bounds and letter grades arrive
//! computed and are never recalculated locally.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display grade, either a number or a label such as "B+".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GradeValue {
    Numeric(f64),
    Label(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiPrediction {
    pub grade: GradeValue,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedItem {
    pub name: String,
    pub grade: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CategoryGrades {
    pub completed: Vec<CompletedItem>,
    pub remaining: Vec<String>,
    /// Absent exactly when nothing in the category has been graded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
}

impl CategoryGrades {
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn remaining_count(&self) -> usize {
        self.remaining.len()
    }

    pub fn total_count(&self) -> usize {
        self.completed_count() + self.remaining_count()
    }

    /// Share of items already graded, `None` for an empty category.
    pub fn completion_ratio(&self) -> Option<f64> {
        match self.total_count() {
            0 => None,
            total => Some(self.completed_count() as f64 / total as f64),
        }
    }

    /// Names listed both as completed and as remaining.
    pub fn overlapping_names(&self) -> Vec<String> {
        let remaining: HashSet<&str> = self.remaining.iter().map(String::as_str).collect();
        let mut overlap: Vec<String> = self
            .completed
            .iter()
            .filter(|item| remaining.contains(item.name.as_str()))
            .map(|item| item.name.clone())
            .collect();
        overlap.sort();
        overlap.dedup();
        overlap
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub grade: GradeValue,
    pub current_percentage: f64,
    pub letter_grade: String,
    pub min_possible_grade: f64,
    pub max_possible_grade: f64,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_prediction: Option<AiPrediction>,
    #[serde(default)]
    pub categorized_grades: BTreeMap<String, CategoryGrades>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradeBounds {
    pub min: f64,
    pub current: f64,
    pub max: f64,
}

impl GradeBounds {
    pub fn is_consistent(&self) -> bool {
        self.min <= self.current && self.current <= self.max
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSummary {
    pub categories: usize,
    pub completed: usize,
    pub remaining: usize,
}

impl CompletionSummary {
    pub fn total(&self) -> usize {
        self.completed + self.remaining
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DataQualityIssue {
    BoundsViolated { bounds: GradeBounds },
    CompletedAndRemaining { category: String, names: Vec<String> },
}

impl Prediction {
    pub fn bounds(&self) -> GradeBounds {
        GradeBounds {
            min: self.min_possible_grade,
            current: self.current_percentage,
            max: self.max_possible_grade,
        }
    }

    pub fn bounds_consistent(&self) -> bool {
        self.bounds().is_consistent()
    }

    pub fn category(&self, name: &str) -> Option<&CategoryGrades> {
        self.categorized_grades.get(name)
    }

    pub fn completion(&self) -> CompletionSummary {
        self.categorized_grades.values().fold(
            CompletionSummary {
                categories: self.categorized_grades.len(),
                ..Default::default()
            },
            |mut summary, category| {
                summary.completed += category.completed_count();
                summary.remaining += category.remaining_count();
                summary
            },
        )
    }

    /// Producer-side inconsistencies, reported but never corrected here.
    pub fn quality_issues(&self) -> Vec<DataQualityIssue> {
        let mut issues = Vec::new();

        let bounds = self.bounds();
        if !bounds.is_consistent() {
            issues.push(DataQualityIssue::BoundsViolated { bounds });
        }

        for (category, grades) in &self.categorized_grades {
            let names = grades.overlapping_names();
            if !names.is_empty() {
                issues.push(DataQualityIssue::CompletedAndRemaining {
                    category: category.clone(),
                    names,
                });
            }
        }

        issues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PredictionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Latest persisted prediction as delivered by the result feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub prediction: Prediction,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LatestPredictionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<FeedRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
