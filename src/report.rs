use std::collections::HashMap;
use std::fmt::Write;

use crate::curriculum;
use crate::models::{AlertTypeSummary, LearnerRecord, StruggleAlert};

pub fn summarize_by_type(alerts: &[StruggleAlert]) -> Vec<AlertTypeSummary> {
    let mut counts = HashMap::new();
    for alert in alerts {
        *counts.entry(alert.struggle_type).or_insert(0usize) += 1;
    }

    let mut summaries: Vec<AlertTypeSummary> = counts
        .into_iter()
        .map(|(struggle_type, count)| AlertTypeSummary {
            struggle_type,
            count,
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.struggle_type.as_str().cmp(b.struggle_type.as_str()))
    });
    summaries
}

pub fn build_report(learner: &LearnerRecord, alerts: &[StruggleAlert]) -> String {
    let summaries = summarize_by_type(alerts);
    let mut output = String::new();

    let _ = writeln!(output, "# Learner Progress Report");
    let last_activity = learner
        .last_activity
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    let _ = writeln!(
        output,
        "Generated for {} (streak {}, last active {})",
        learner.learner_id, learner.streak, last_activity
    );
    let _ = writeln!(
        output,
        "{} exercises and {} quizzes recorded.",
        learner.total_exercises, learner.total_quizzes
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Module Mastery");
    let _ = writeln!(
        output,
        "| module | mastery | level | exercise | quiz | code | exercises | quizzes |"
    );
    let _ = writeln!(output, "|---|---|---|---|---|---|---|---|");

    for module in curriculum::list_modules() {
        let Some(record) = learner.modules.get(module.id) else {
            continue;
        };
        let _ = writeln!(
            output,
            "| {} {} | {:.1} | {} | {:.1} | {:.1} | {:.1} | {} | {} |",
            record.module_id,
            record.module_name,
            record.mastery,
            record.mastery_level,
            record.exercise_score,
            record.quiz_score,
            record.code_quality,
            record.exercises_completed,
            record.quizzes_taken
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Open Struggle Alerts");

    if summaries.is_empty() {
        let _ = writeln!(output, "No open struggle alerts.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(output, "- {}: {} alerts", summary.struggle_type, summary.count);
        }
    }

    let mut recent = alerts.to_vec();
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Alerts");

    if recent.is_empty() {
        let _ = writeln!(output, "No alerts recorded.");
    } else {
        for alert in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} ({}) on {}: {}",
                alert.struggle_type,
                alert.module_id.as_deref().unwrap_or("no module"),
                alert.created_at.format("%Y-%m-%d %H:%M"),
                alert.details
            );
        }
    }

    output
}
