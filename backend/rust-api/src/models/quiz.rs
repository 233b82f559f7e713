use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const WRITING_SUBJECT: &str = "Writing";

lazy_static! {
    static ref YEAR_PREFIX_RE: Regex =
        Regex::new(r"(?i)\b(?:year|yr|grade)\s*([3579])\b").expect("valid year regex");
    static ref YEAR_SUFFIX_RE: Regex =
        Regex::new(r"(?i)\b([3579])\s*(?:year|yr|grade)\b").expect("valid year regex");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub year_level: Option<u8>,
    #[serde(default)]
    pub is_trial: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Time limit in minutes; `None` means untimed.
    #[serde(default)]
    pub time_limit_minutes: Option<u32>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_active() -> bool {
    true
}

impl Quiz {
    /// Declared subject, or the subject inferred from the quiz name.
    pub fn resolved_subject(&self) -> String {
        match self.subject.as_deref().map(str::trim) {
            Some(subject) if !subject.is_empty() => subject.to_string(),
            _ => infer_subject_from_name(&self.name).to_string(),
        }
    }

    pub fn resolved_year_level(&self) -> Option<u8> {
        self.year_level.or_else(|| infer_year_level_from_name(&self.name))
    }

    pub fn track(&self) -> Track {
        Track::for_subject(&self.resolved_subject())
    }
}

/// Scoring path for a quiz: objective quizzes are scored in-process, writing
/// quizzes get their real score from the feedback generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Objective,
    Writing,
}

impl Track {
    pub fn for_subject(subject: &str) -> Self {
        if subject.trim().eq_ignore_ascii_case(WRITING_SUBJECT) {
            Track::Writing
        } else {
            Track::Objective
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Objective => "objective",
            Track::Writing => "writing",
        }
    }
}

pub fn infer_subject_from_name(quiz_name: &str) -> &'static str {
    let name = quiz_name.to_lowercase();
    if name.contains("numeracy") || name.contains("mathematics") || name.contains("math") {
        "Numeracy"
    } else if name.contains("convention") {
        "Language Conventions"
    } else if name.contains("reading") {
        "Reading"
    } else if name.contains("writing") {
        WRITING_SUBJECT
    } else {
        "General Assessment"
    }
}

pub fn infer_year_level_from_name(quiz_name: &str) -> Option<u8> {
    let captured = YEAR_PREFIX_RE
        .captures(quiz_name)
        .or_else(|| YEAR_SUFFIX_RE.captures(quiz_name))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok());
    if captured.is_some() {
        return captured;
    }

    // Compact spellings such as "Year3" or "yr5".
    let compact = quiz_name.to_lowercase().replace(' ', "");
    [3u8, 5, 7, 9].into_iter().find(|year| {
        ["year", "yr", "grade"]
            .iter()
            .any(|prefix| compact.contains(&format!("{}{}", prefix, year)))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    FreeText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub correct: bool,
}

/// Authoritative question record, including correctness flags. Only the
/// scoring path sees this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: String,
    pub quiz_id: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    #[serde(default)]
    pub text: String,
    pub points: u32,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub position: u32,
}

impl Question {
    pub fn correct_option_ids(&self) -> impl Iterator<Item = &str> {
        self.options
            .iter()
            .filter(|option| option.correct)
            .map(|option| option.id.as_str())
    }
}

/// Learner-facing question: same content, correctness flags stripped.
#[derive(Debug, Clone, Serialize)]
pub struct LearnerQuestion {
    pub id: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub text: String,
    pub points: u32,
    pub options: Vec<LearnerOption>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnerOption {
    pub id: String,
    pub text: String,
}

impl From<&Question> for LearnerQuestion {
    fn from(question: &Question) -> Self {
        Self {
            id: question.id.clone(),
            question_type: question.question_type,
            text: question.text.clone(),
            points: question.points,
            options: question
                .options
                .iter()
                .map(|option| LearnerOption {
                    id: option.id.clone(),
                    text: option.text.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiz(name: &str, subject: Option<&str>) -> Quiz {
        Quiz {
            id: "q1".into(),
            name: name.into(),
            subject: subject.map(String::from),
            year_level: None,
            is_trial: false,
            is_active: true,
            time_limit_minutes: None,
            max_attempts: None,
        }
    }

    #[test]
    fn test_subject_inference_from_name() {
        assert_eq!(infer_subject_from_name("Year 3 Numeracy Set A"), "Numeracy");
        assert_eq!(infer_subject_from_name("Language Conventions 5"), "Language Conventions");
        assert_eq!(infer_subject_from_name("Reading Practice"), "Reading");
        assert_eq!(infer_subject_from_name("Persuasive Writing"), "Writing");
        assert_eq!(infer_subject_from_name("Mock exam"), "General Assessment");
    }

    #[test]
    fn test_declared_subject_wins() {
        let q = quiz("Writing warmup", Some("Reading"));
        assert_eq!(q.resolved_subject(), "Reading");
        assert_eq!(q.track(), Track::Objective);

        let q = quiz("Narrative task", Some("writing"));
        assert_eq!(q.track(), Track::Writing);
    }

    #[test]
    fn test_track_from_inferred_subject() {
        assert_eq!(quiz("Year 5 Writing", None).track(), Track::Writing);
        assert_eq!(quiz("Year 5 Numeracy", None).track(), Track::Objective);
    }

    #[test]
    fn test_year_level_inference() {
        assert_eq!(infer_year_level_from_name("Year 3 Numeracy"), Some(3));
        assert_eq!(infer_year_level_from_name("Grade 7 reading"), Some(7));
        assert_eq!(infer_year_level_from_name("9 yr conventions"), Some(9));
        assert_eq!(infer_year_level_from_name("Year5 Writing"), Some(5));
        assert_eq!(infer_year_level_from_name("Year 4 Numeracy"), None);
        assert_eq!(infer_year_level_from_name("Numeracy"), None);
    }

    #[test]
    fn test_learner_question_strips_correctness() {
        let question = Question {
            id: "qq".into(),
            quiz_id: "q1".into(),
            question_type: QuestionType::SingleChoice,
            text: "2 + 2".into(),
            points: 1,
            options: vec![
                QuestionOption { id: "a".into(), text: "3".into(), correct: false },
                QuestionOption { id: "b".into(), text: "4".into(), correct: true },
            ],
            topics: vec!["Addition".into()],
            position: 0,
        };
        let view = serde_json::to_value(LearnerQuestion::from(&question)).unwrap();
        assert!(!view.to_string().contains("correct"));
        assert_eq!(view["options"][1]["id"], "b");
    }
}
