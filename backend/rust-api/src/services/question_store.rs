use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{Question, Quiz};

/// Read-only access to quiz content. The engine never writes through this.
#[async_trait]
pub trait QuestionStore: Send + Sync {
    async fn get_quiz(&self, quiz_id: &str) -> Result<Option<Quiz>>;

    /// Authoritative questions (correctness flags included), ordered by
    /// position.
    async fn get_questions(&self, quiz_id: &str) -> Result<Vec<Question>>;
}

#[derive(Default)]
pub struct InMemoryQuestionStore {
    quizzes: RwLock<HashMap<String, Quiz>>,
    questions: RwLock<HashMap<String, Vec<Question>>>,
}

impl InMemoryQuestionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_quiz(&self, quiz: Quiz, mut questions: Vec<Question>) {
        questions.sort_by_key(|q| q.position);
        self.questions.write().await.insert(quiz.id.clone(), questions);
        self.quizzes.write().await.insert(quiz.id.clone(), quiz);
    }
}

#[async_trait]
impl QuestionStore for InMemoryQuestionStore {
    async fn get_quiz(&self, quiz_id: &str) -> Result<Option<Quiz>> {
        Ok(self.quizzes.read().await.get(quiz_id).cloned())
    }

    async fn get_questions(&self, quiz_id: &str) -> Result<Vec<Question>> {
        Ok(self
            .questions
            .read()
            .await
            .get(quiz_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn total_points(questions: &[Question]) -> u32 {
    questions.iter().map(|q| q.points).sum()
}
