#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use quizattempt_api::{
    config::{AttemptSettings, Config, FeedbackMode, FeedbackSettings, SweeperSettings},
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    models::feedback::{FeedbackRequest, GeneratorOutcome},
    models::quiz::QuestionOption,
    models::{
        AccountStatus, Attempt, AttemptStatus, FeedbackMeta, LearnerContext, Question,
        QuestionType, Quiz, QuizSnapshot, TopicBreakdown,
    },
    services::{
        attempt_store::{AttemptStore, InMemoryAttemptStore},
        cache::InMemoryCache,
        entitlement::StaticEntitlementOracle,
        feedback_generator::FeedbackGenerator,
        question_store::InMemoryQuestionStore,
        AppState,
    },
};

pub const JWT_SECRET: &str = "test-secret";
pub const NUMERACY_QUIZ: &str = "quiz-numeracy-y5";
pub const WRITING_QUIZ: &str = "quiz-writing-y5";
pub const TIMED_QUIZ: &str = "quiz-reading-y5-timed";
pub const PREMIUM_QUIZ: &str = "quiz-numeracy-y7";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn test_config() -> Config {
    Config {
        mongo_uri: "mongodb://localhost:27017".to_string(),
        redis_uri: "redis://127.0.0.1:6379/0".to_string(),
        mongo_database: "quizattempts_test".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        attempts: AttemptSettings {
            start_rate_limit_per_minute: 1000,
            ..AttemptSettings::default()
        },
        sweeper: SweeperSettings {
            run_in_api: false,
            ..SweeperSettings::default()
        },
        feedback: FeedbackSettings {
            mode: FeedbackMode::Http,
            timeout_secs: 5,
            ..FeedbackSettings::default()
        },
    }
}

/// What the scripted generator does on one call.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed(Value),
    Fail(String),
    Hang,
    Panic,
}

/// Feedback generator driven by a queue of scripted behaviours. Once the
/// queue is empty every call succeeds.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub async fn push(&self, step: Script) {
        self.script.lock().await.push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn default_feedback(request: &FeedbackRequest) -> Value {
    match request {
        FeedbackRequest::Objective(_) => json!({
            "overall_feedback": "Solid work on number sense.",
            "strengths": ["fractions"],
        }),
        FeedbackRequest::Writing(_) => json!({
            "overall_feedback": "Clear structure and good vocabulary.",
            "overall": { "total_score": 36, "max_score": 48 },
        }),
    }
}

#[async_trait]
impl FeedbackGenerator for ScriptedGenerator {
    async fn generate(&self, request: &FeedbackRequest) -> anyhow::Result<GeneratorOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().await.pop_front();

        match step {
            None => Ok(GeneratorOutcome::Success {
                feedback: default_feedback(request),
                analysis: None,
                generated_at: None,
            }),
            Some(Script::Succeed(feedback)) => Ok(GeneratorOutcome::Success {
                feedback,
                analysis: None,
                generated_at: None,
            }),
            Some(Script::Fail(error)) => Ok(GeneratorOutcome::Failure { error }),
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(GeneratorOutcome::Failure {
                    error: "unreachable".to_string(),
                })
            }
            Some(Script::Panic) => panic!("scripted generator panic"),
        }
    }
}

pub struct TestHarness {
    pub state: Arc<AppState>,
    pub attempts: Arc<InMemoryAttemptStore>,
    pub questions: Arc<InMemoryQuestionStore>,
    pub entitlements: Arc<StaticEntitlementOracle>,
    pub generator: Arc<ScriptedGenerator>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        init_tracing();

        let attempts = Arc::new(InMemoryAttemptStore::new());
        let questions = Arc::new(InMemoryQuestionStore::new());
        let entitlements = Arc::new(StaticEntitlementOracle::new(attempts.clone()));
        let generator = Arc::new(ScriptedGenerator::new());

        seed_quizzes(&questions).await;
        entitlements
            .set_account_status("parent-1", AccountStatus::Active)
            .await;
        entitlements
            .set_account_status("parent-2", AccountStatus::Active)
            .await;

        let state = Arc::new(AppState::from_parts(
            config,
            attempts.clone(),
            questions.clone(),
            entitlements.clone(),
            generator.clone(),
            Arc::new(InMemoryCache::new()),
        ));

        Self {
            state,
            attempts,
            questions,
            entitlements,
            generator,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub async fn attempt(&self, attempt_id: &str) -> Attempt {
        self.attempts
            .get(attempt_id)
            .await
            .unwrap()
            .expect("attempt should exist")
    }

    /// Polls until the attempt's feedback settles, failing after ~5s.
    pub async fn wait_for_feedback(&self, attempt_id: &str) -> Attempt {
        for _ in 0..500 {
            let attempt = self.attempt(attempt_id).await;
            if attempt.feedback.status.is_terminal() {
                return attempt;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("feedback for {} never settled", attempt_id);
    }

    /// Rewrites a stored attempt in place, bypassing the lifecycle rules.
    pub async fn rewrite(&self, attempt_id: &str, mutate: impl FnOnce(&mut Attempt)) {
        let mut attempt = self.attempt(attempt_id).await;
        let expected = attempt.status;
        mutate(&mut attempt);
        assert!(self
            .attempts
            .replace_if_status(&attempt, expected)
            .await
            .unwrap());
    }

    /// Inserts a historical attempt for `learner` on `quiz_id`.
    pub async fn seed_attempt(
        &self,
        learner: &LearnerContext,
        quiz_id: &str,
        status: AttemptStatus,
        attempt_number: u32,
        started_at: DateTime<Utc>,
    ) -> Attempt {
        let attempt = Attempt {
            id: Uuid::new_v4().to_string(),
            learner_id: learner.learner_id.clone(),
            account_id: learner.account_id.clone(),
            quiz_id: quiz_id.to_string(),
            quiz: QuizSnapshot {
                name: "Year 5 Numeracy Practice".to_string(),
                subject: "Numeracy".to_string(),
                year_level: Some(5),
                total_points: 3,
                track: quizattempt_api::models::Track::Objective,
            },
            status,
            attempt_number,
            started_at,
            submitted_at: (status != AttemptStatus::InProgress).then_some(started_at),
            duration_seconds: None,
            expires_at: None,
            timer_expired: false,
            answers: Vec::new(),
            score: None,
            topic_breakdown: TopicBreakdown::new(),
            feedback: FeedbackMeta::pending(),
            feedback_payload: None,
            performance_analysis: None,
            proctoring: None,
        };
        self.attempts.insert(&attempt).await.unwrap();
        attempt
    }
}

pub fn learner(id: &str, account: &str) -> LearnerContext {
    LearnerContext {
        learner_id: id.to_string(),
        account_id: account.to_string(),
        year_level: Some(5),
    }
}

pub fn child() -> LearnerContext {
    learner("child-1", "parent-1")
}

pub fn sibling() -> LearnerContext {
    learner("child-2", "parent-2")
}

pub fn token_for(learner: &LearnerContext, role: &str) -> String {
    let now = Utc::now().timestamp();
    let claims = JwtClaims {
        sub: learner.learner_id.clone(),
        account_id: learner.account_id.clone(),
        role: role.to_string(),
        year_level: learner.year_level,
        exp: (now + 3600) as usize,
        iat: now as usize,
    };
    JwtService::new(JWT_SECRET).generate_token(&claims).unwrap()
}

fn option(id: &str, correct: bool) -> QuestionOption {
    QuestionOption {
        id: id.to_string(),
        text: format!("Option {}", id),
        correct,
    }
}

fn choice(quiz_id: &str, id: &str, position: u32, correct: &str, topic: &str) -> Question {
    Question {
        id: id.to_string(),
        quiz_id: quiz_id.to_string(),
        question_type: QuestionType::SingleChoice,
        text: format!("Question {}", id),
        points: 1,
        options: vec![option("a", correct == "a"), option("b", correct == "b")],
        topics: vec![topic.to_string()],
        position,
    }
}

fn quiz(id: &str, name: &str, subject: &str) -> Quiz {
    Quiz {
        id: id.to_string(),
        name: name.to_string(),
        subject: Some(subject.to_string()),
        year_level: Some(5),
        is_trial: false,
        is_active: true,
        time_limit_minutes: None,
        max_attempts: None,
    }
}

async fn seed_quizzes(store: &InMemoryQuestionStore) {
    store
        .put_quiz(
            quiz(NUMERACY_QUIZ, "Year 5 Numeracy Practice", "Numeracy"),
            vec![
                choice(NUMERACY_QUIZ, "n1", 1, "a", "fractions"),
                choice(NUMERACY_QUIZ, "n2", 2, "b", "fractions"),
                choice(NUMERACY_QUIZ, "n3", 3, "a", "geometry"),
            ],
        )
        .await;

    store
        .put_quiz(
            Quiz {
                time_limit_minutes: Some(30),
                ..quiz(TIMED_QUIZ, "Year 5 Reading Timed", "Reading")
            },
            vec![choice(TIMED_QUIZ, "r1", 1, "a", "inference")],
        )
        .await;

    store
        .put_quiz(
            quiz(WRITING_QUIZ, "Year 5 Writing Task", "Writing"),
            vec![Question {
                id: "w1".to_string(),
                quiz_id: WRITING_QUIZ.to_string(),
                question_type: QuestionType::FreeText,
                text: "Write a persuasive piece about school uniforms.".to_string(),
                points: 48,
                options: Vec::new(),
                topics: vec!["persuasive".to_string()],
                position: 1,
            }],
        )
        .await;

    store
        .put_quiz(
            Quiz {
                year_level: Some(7),
                ..quiz(PREMIUM_QUIZ, "Year 7 Numeracy", "Numeracy")
            },
            vec![choice(PREMIUM_QUIZ, "p1", 1, "a", "algebra")],
        )
        .await;
}
