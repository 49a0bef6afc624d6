//! Read-only aggregations over committed grading results.
//!
//! Only results of COMPLETED jobs are considered, and a sheet graded by more
//! than one completed job contributes the rows of its latest job only. The
//! `compute_*` functions are pure; the async wrappers load their inputs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::db::models::{CommittedResult, TemplateWithRegions};
use crate::db::types::Correctness;
use crate::services::errors::GradingError;
use crate::store::GradingStore;

pub(crate) const DEFAULT_BUCKETS: usize = 10;
pub(crate) const MAX_BUCKETS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ClassSummary {
    pub(crate) template_id: String,
    pub(crate) sheet_count: usize,
    pub(crate) mean_score: Option<f64>,
    pub(crate) min_score: Option<f64>,
    pub(crate) max_score: Option<f64>,
    pub(crate) max_possible: f64,
    pub(crate) pass_threshold: f64,
    pub(crate) passed_count: usize,
    pub(crate) pass_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QuestionStats {
    pub(crate) region_id: String,
    pub(crate) label: String,
    pub(crate) points: f64,
    pub(crate) total_attempts: usize,
    pub(crate) correct_count: usize,
    pub(crate) partial_count: usize,
    pub(crate) incorrect_count: usize,
    pub(crate) skipped_count: usize,
    pub(crate) mean_score: Option<f64>,
    /// Share of attempts graded correct; `None` without attempts.
    pub(crate) difficulty_index: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QuestionAnalysis {
    pub(crate) template_id: String,
    pub(crate) questions: Vec<QuestionStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ScoreBucket {
    pub(crate) lower_percent: f64,
    pub(crate) upper_percent: f64,
    pub(crate) count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ScoreDistribution {
    pub(crate) template_id: String,
    pub(crate) sheet_count: usize,
    pub(crate) buckets: Vec<ScoreBucket>,
}

/// Rows of the latest completed job per sheet, ordered by (sheet, region).
fn latest_rows(rows: &[CommittedResult]) -> Vec<&CommittedResult> {
    let mut latest: HashMap<&str, (&time::PrimitiveDateTime, &str)> = HashMap::new();
    for row in rows {
        let candidate = (&row.job_created_at, row.job_id.as_str());
        latest
            .entry(row.sheet_id.as_str())
            .and_modify(|current| {
                if candidate > *current {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    let mut kept: Vec<&CommittedResult> = rows
        .iter()
        .filter(|row| latest.get(row.sheet_id.as_str()).is_some_and(|(_, job)| *job == row.job_id))
        .collect();
    kept.sort_by(|a, b| a.sheet_id.cmp(&b.sheet_id).then_with(|| a.region_id.cmp(&b.region_id)));
    kept
}

fn sheet_totals(rows: &[&CommittedResult]) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for row in rows {
        *totals.entry(row.sheet_id.clone()).or_insert(0.0) += row.assigned_score;
    }
    totals
}

pub(crate) fn compute_summary(
    template: &TemplateWithRegions,
    rows: &[CommittedResult],
) -> ClassSummary {
    let totals = sheet_totals(&latest_rows(rows));
    let max_possible = template.max_points();
    let pass_threshold = template.template.pass_threshold;
    let scores: Vec<f64> = totals.values().copied().collect();

    let sheet_count = scores.len();
    let passed_count =
        scores.iter().filter(|total| **total >= pass_threshold * max_possible).count();
    let (mean_score, pass_rate) = if sheet_count == 0 {
        (None, None)
    } else {
        (
            Some(scores.iter().sum::<f64>() / sheet_count as f64),
            Some(passed_count as f64 / sheet_count as f64),
        )
    };

    ClassSummary {
        template_id: template.template.id.clone(),
        sheet_count,
        mean_score,
        min_score: scores.iter().copied().reduce(f64::min),
        max_score: scores.iter().copied().reduce(f64::max),
        max_possible,
        pass_threshold,
        passed_count,
        pass_rate,
    }
}

pub(crate) fn compute_questions(
    template: &TemplateWithRegions,
    rows: &[CommittedResult],
) -> QuestionAnalysis {
    let latest = latest_rows(rows);
    let questions = template
        .regions
        .iter()
        .map(|region| {
            let attempts: Vec<&&CommittedResult> =
                latest.iter().filter(|row| row.region_id == region.id).collect();
            let count = |correctness: Correctness| {
                attempts.iter().filter(|row| row.correctness == correctness).count()
            };
            let total_attempts = attempts.len();
            let correct_count = count(Correctness::Correct);
            let (mean_score, difficulty_index) = if total_attempts == 0 {
                (None, None)
            } else {
                let sum: f64 = attempts.iter().map(|row| row.assigned_score).sum();
                (
                    Some(sum / total_attempts as f64),
                    Some(correct_count as f64 / total_attempts as f64),
                )
            };

            QuestionStats {
                region_id: region.id.clone(),
                label: region.label.clone(),
                points: region.points,
                total_attempts,
                correct_count,
                partial_count: count(Correctness::Partial),
                incorrect_count: count(Correctness::Incorrect),
                skipped_count: count(Correctness::Skipped),
                mean_score,
                difficulty_index,
            }
        })
        .collect();

    QuestionAnalysis { template_id: template.template.id.clone(), questions }
}

/// Histogram of per-sheet percentages; 100% lands in the last bucket.
pub(crate) fn compute_distribution(
    template: &TemplateWithRegions,
    rows: &[CommittedResult],
    buckets: usize,
) -> Result<ScoreDistribution, GradingError> {
    if !(1..=MAX_BUCKETS).contains(&buckets) {
        return Err(GradingError::validation(format!("buckets must be within 1..={MAX_BUCKETS}")));
    }

    let totals = sheet_totals(&latest_rows(rows));
    let max_possible = template.max_points();
    let width = 100.0 / buckets as f64;
    let mut counts = vec![0usize; buckets];

    for total in totals.values() {
        let percent = if max_possible > 0.0 { total / max_possible * 100.0 } else { 0.0 };
        let index = ((percent / width).floor().max(0.0) as usize).min(buckets - 1);
        counts[index] += 1;
    }

    Ok(ScoreDistribution {
        template_id: template.template.id.clone(),
        sheet_count: totals.len(),
        buckets: counts
            .into_iter()
            .enumerate()
            .map(|(index, count)| ScoreBucket {
                lower_percent: index as f64 * width,
                upper_percent: (index + 1) as f64 * width,
                count,
            })
            .collect(),
    })
}

async fn load(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<(TemplateWithRegions, Vec<CommittedResult>), GradingError> {
    let template =
        store.find_template(template_id).await?.ok_or(GradingError::NotFound("template"))?;
    let rows = store.list_committed_results(template_id).await?;
    Ok((template, rows))
}

pub(crate) async fn class_summary(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<ClassSummary, GradingError> {
    let (template, rows) = load(store, template_id).await?;
    Ok(compute_summary(&template, &rows))
}

pub(crate) async fn question_analysis(
    store: &dyn GradingStore,
    template_id: &str,
) -> Result<QuestionAnalysis, GradingError> {
    let (template, rows) = load(store, template_id).await?;
    Ok(compute_questions(&template, &rows))
}

pub(crate) async fn score_distribution(
    store: &dyn GradingStore,
    template_id: &str,
    buckets: usize,
) -> Result<ScoreDistribution, GradingError> {
    let (template, rows) = load(store, template_id).await?;
    compute_distribution(&template, &rows, buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::primitive_now_utc;
    use crate::services::templates::create_template;
    use crate::store::MemoryStore;
    use crate::test_support;

    async fn quiz() -> TemplateWithRegions {
        let store = MemoryStore::new();
        let mut input = test_support::template_input("Quiz", &[("q1", 6.0), ("q2", 4.0)]);
        input.pass_threshold = Some(0.6);
        create_template(&store, input, "teacher-1", primitive_now_utc()).await.expect("template")
    }

    fn row(
        template: &TemplateWithRegions,
        job: &str,
        minutes: i64,
        sheet: &str,
        region: usize,
        correctness: Correctness,
        score: f64,
    ) -> CommittedResult {
        CommittedResult {
            job_id: job.to_string(),
            sheet_id: sheet.to_string(),
            region_id: template.regions[region].id.clone(),
            correctness,
            assigned_score: score,
            job_created_at: time::macros::datetime!(2026-03-01 09:00) + time::Duration::minutes(minutes),
        }
    }

    fn class(template: &TemplateWithRegions) -> Vec<CommittedResult> {
        use Correctness::*;
        vec![
            row(template, "job-a", 0, "s1", 0, Correct, 6.0),
            row(template, "job-a", 0, "s1", 1, Correct, 4.0),
            row(template, "job-a", 0, "s2", 0, Partial, 3.0),
            row(template, "job-a", 0, "s2", 1, Incorrect, 0.0),
            row(template, "job-a", 0, "s3", 0, Incorrect, 0.0),
            row(template, "job-a", 0, "s3", 1, Skipped, 0.0),
            // s3 was re-graded later; only these rows count for it
            row(template, "job-b", 30, "s3", 0, Correct, 6.0),
            row(template, "job-b", 30, "s3", 1, Partial, 1.0),
        ]
    }

    #[tokio::test]
    async fn summary_counts_the_latest_job_per_sheet() {
        let template = quiz().await;

        let summary = compute_summary(&template, &class(&template));

        assert_eq!(summary.sheet_count, 3);
        assert_eq!(summary.max_possible, 10.0);
        assert_eq!(summary.min_score, Some(3.0));
        assert_eq!(summary.max_score, Some(10.0));
        assert_eq!(summary.mean_score, Some(20.0 / 3.0));
        assert_eq!(summary.passed_count, 2);
        assert_eq!(summary.pass_rate, Some(2.0 / 3.0));
    }

    #[tokio::test]
    async fn empty_template_has_no_statistics() {
        let template = quiz().await;

        let summary = compute_summary(&template, &[]);
        let questions = compute_questions(&template, &[]);

        assert_eq!(summary.sheet_count, 0);
        assert_eq!(summary.mean_score, None);
        assert_eq!(summary.pass_rate, None);
        assert_eq!(questions.questions.len(), 2);
        assert!(questions.questions.iter().all(|q| q.difficulty_index.is_none()));
    }

    #[tokio::test]
    async fn question_analysis_is_deterministic_in_template_order() {
        let template = quiz().await;
        let rows = class(&template);
        let mut reversed = rows.clone();
        reversed.reverse();

        let analysis = compute_questions(&template, &rows);

        assert_eq!(analysis, compute_questions(&template, &reversed));
        let q1 = &analysis.questions[0];
        assert_eq!(q1.label, "q1");
        assert_eq!((q1.total_attempts, q1.correct_count, q1.partial_count), (3, 2, 1));
        assert_eq!(q1.mean_score, Some(5.0));
        assert_eq!(q1.difficulty_index, Some(2.0 / 3.0));
        let q2 = &analysis.questions[1];
        assert_eq!((q2.correct_count, q2.partial_count, q2.incorrect_count, q2.skipped_count), (1, 1, 1, 0));
    }

    #[tokio::test]
    async fn distribution_puts_full_marks_in_the_last_bucket() {
        let template = quiz().await;

        let distribution = compute_distribution(&template, &class(&template), 10).expect("histogram");

        assert_eq!(distribution.sheet_count, 3);
        assert_eq!(distribution.buckets.len(), 10);
        assert_eq!(distribution.buckets[9].count, 1);
        assert_eq!(distribution.buckets[7].count, 1);
        assert_eq!(distribution.buckets[3].count, 1);
        assert_eq!(distribution.buckets[9].upper_percent, 100.0);
        assert_eq!(distribution.buckets.iter().map(|b| b.count).sum::<usize>(), 3);

        for buckets in [0, MAX_BUCKETS + 1] {
            assert!(matches!(
                compute_distribution(&template, &[], buckets),
                Err(GradingError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn reports_read_completed_jobs_from_the_store() {
        let fixture = test_support::graded_fixture(&[0.9, 0.6]).await;
        let store = fixture.store.as_ref();
        let template_id = &fixture.template.template.id;

        let summary = class_summary(store, template_id).await.expect("summary");
        let distribution = score_distribution(store, template_id, 4).await.expect("distribution");

        assert_eq!(summary.sheet_count, 2);
        assert_eq!(distribution.buckets.len(), 4);
        assert!(matches!(
            question_analysis(store, "missing").await,
            Err(GradingError::NotFound("template"))
        ));
    }
}
