//! Deterministic scoring of a submitted answer set against the authoritative
//! question set. No I/O happens here.

use std::collections::{BTreeSet, HashMap};

use crate::models::{AnswerRecord, Question, QuestionType, ScoreSummary, TopicBreakdown};

pub const PASS_PERCENTAGE: u32 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringResult {
    pub answers: Vec<AnswerRecord>,
    pub total_scored: u32,
    pub total_available: u32,
    pub topic_breakdown: TopicBreakdown,
    pub summary: ScoreSummary,
}

pub fn score_answers(questions: &[Question], submitted: &[AnswerRecord]) -> ScoringResult {
    let by_id: HashMap<&str, &Question> = questions.iter().map(|q| (q.id.as_str(), q)).collect();

    let mut total_scored = 0u32;
    let mut total_available = 0u32;
    let mut topic_breakdown = TopicBreakdown::new();
    let mut answers = Vec::with_capacity(submitted.len());

    // A question answered twice counts once, with its last answer.
    let last_index: HashMap<&str, usize> = submitted
        .iter()
        .enumerate()
        .map(|(idx, a)| (a.question_id.as_str(), idx))
        .collect();

    for (idx, answer) in submitted.iter().enumerate() {
        if last_index.get(answer.question_id.as_str()) != Some(&idx) {
            continue;
        }
        let mut scored = answer.clone();

        let Some(question) = by_id.get(answer.question_id.as_str()) else {
            // Question no longer in the live set.
            scored.points_scored = 0;
            scored.points_available = 0;
            answers.push(scored);
            continue;
        };

        let available = question.points;
        let points = if is_correct(question, answer) { available } else { 0 };

        scored.points_scored = points;
        scored.points_available = available;
        total_scored += points;
        total_available += available;

        for topic in &question.topics {
            let entry = topic_breakdown.entry(topic.clone()).or_default();
            entry.scored += points;
            entry.total += available;
        }

        answers.push(scored);
    }

    ScoringResult {
        answers,
        total_scored,
        total_available,
        topic_breakdown,
        summary: summarize(total_scored, total_available),
    }
}

/// Exact set equality on option ids. Free text never scores here.
pub fn is_correct(question: &Question, answer: &AnswerRecord) -> bool {
    if question.question_type == QuestionType::FreeText {
        return false;
    }

    let selected: BTreeSet<&str> = answer.selected_option_ids.iter().map(String::as_str).collect();
    let correct: BTreeSet<&str> = question.correct_option_ids().collect();

    !correct.is_empty() && selected == correct
}

pub fn percentage(points: u32, available: u32) -> u32 {
    if available == 0 {
        return 0;
    }
    (100.0 * points as f64 / available as f64).round() as u32
}

pub fn grade_for(percentage: u32) -> &'static str {
    match percentage {
        p if p >= 90 => "A",
        p if p >= 75 => "B",
        p if p >= 60 => "C",
        p if p >= 50 => "D",
        _ => "F",
    }
}

pub fn summarize(points: u32, available: u32) -> ScoreSummary {
    let pct = percentage(points, available);
    ScoreSummary {
        points,
        available,
        percentage: pct,
        grade: grade_for(pct).to_string(),
        pass: pct >= PASS_PERCENTAGE,
    }
}
