use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value; // immutable fields are only checked for presence
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use crate::auth::Role;
use crate::votes::{ViewerVote, VoterSet};

pub type Id = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub password_hash: String, // argon2 PHC string, never sent to clients
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct PaperTitle {
    pub id: Id,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Paper {
    pub id: Id,
    pub course: String,
    pub year: i32,
    pub title_id: Id,
    pub pdf: String, // base64 encoded document
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Question {
    pub id: Id,
    #[serde(rename = "paper")]
    pub paper_id: Id,
    pub number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: Id,
    pub question_id: Id,
    pub author_id: Id,
    pub votes: i64,
    #[serde(default)]
    pub voters: VoterSet,
    pub html: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
    pub id: Id,
    pub answer_id: Id,
    pub author_id: Id,
    pub parent_id: Option<Id>, // reply tree; None for top-level comments
    pub html: String,
    pub created_at: DateTime<Utc>,
}

// ---------------- request bodies ----------------------------------

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct NewUser {
    #[validate(length(min = 1, max = 12))]
    pub username: String,
    #[validate(length(min = 6, max = 128))]
    pub password: String,
}

/// Store-level insert, password already hashed.
#[derive(Debug, Clone)]
pub struct NewUserRecord {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct NewPaper {
    #[validate(custom(function = "validate_course_code"))]
    pub course: String,
    pub year: i32,
    #[validate(length(min = 1, max = 50))]
    pub title: String,
    pub pdf: String,
}

/// Course codes are one capital letter followed by three digits, e.g. `C212`.
pub fn validate_course_code(code: &str) -> Result<(), ValidationError> {
    let mut chars = code.chars();
    let valid = code.len() == 4
        && chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("course_code"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct NewQuestion {
    #[validate(length(min = 1))]
    pub number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserRef {
    pub id: Id,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct NewAnswer {
    #[serde(deserialize_with = "lenient_id")]
    #[schema(value_type = i64)]
    pub question: Id,
    #[serde(default)]
    pub user: Option<UserRef>, // legacy clients echo the author; must match the token
    #[validate(length(min = 1))]
    pub html: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct NewComment {
    #[serde(deserialize_with = "lenient_id")]
    #[schema(value_type = i64)]
    pub answer: Id,
    #[serde(default)]
    pub parent: Option<Id>,
    #[serde(default)]
    pub user: Option<UserRef>,
    #[validate(length(min = 1))]
    pub html: String,
}

/// Partial answer update. Only `html` may change; the other fields exist so a
/// request that tries to touch them can be rejected instead of ignored.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct AnswerEdit {
    #[serde(deserialize_with = "lenient_id")]
    #[schema(value_type = i64)]
    pub id: Id,
    pub html: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub user: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub question: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub timestamp: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub votes: Option<Value>,
}

impl AnswerEdit {
    pub fn locked_field(&self) -> Option<&'static str> {
        [
            ("user", self.user.is_some()),
            ("question", self.question.is_some()),
            ("timestamp", self.timestamp.is_some()),
            ("votes", self.votes.is_some()),
        ]
        .into_iter()
        .find_map(|(name, present)| present.then_some(name))
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct CommentEdit {
    #[serde(deserialize_with = "lenient_id")]
    #[schema(value_type = i64)]
    pub id: Id,
    pub html: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub user: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub answer: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub parent: Option<Value>,
    #[schema(value_type = Option<Object>)]
    pub timestamp: Option<Value>,
}

impl CommentEdit {
    pub fn locked_field(&self) -> Option<&'static str> {
        [
            ("user", self.user.is_some()),
            ("answer", self.answer.is_some()),
            ("parent", self.parent.is_some()),
            ("timestamp", self.timestamp.is_some()),
        ]
        .into_iter()
        .find_map(|(name, present)| present.then_some(name))
    }
}

/// Accept ids sent either as JSON numbers or numeric strings (`"3"`).
fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<Id, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(Id),
        Str(String),
    }
    match Repr::deserialize(d)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ---------------- response bodies ---------------------------------

/// Flattened paper row used by catalogue listings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct PaperListing {
    pub paper_id: Id,
    pub course: String,
    pub year: i32,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CourseSummary {
    #[serde(rename = "Name")]
    pub name: String,
    pub paper_id: Id, // first paper seen for the course
    #[serde(rename = "Years")]
    pub years: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaperView {
    pub title: String,
    pub pdf: String,
    pub paper_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AnswerView {
    pub id: Id,
    pub user: UserRef,
    pub votes: i64,
    pub timestamp: DateTime<Utc>,
    pub html: String,
    pub can_vote: u8,
    pub has_voted: bool,
    pub question: Id,
}

impl AnswerView {
    pub fn new(answer: &Answer, author: UserRef, viewer: Id) -> Self {
        let state = ViewerVote::of(answer, viewer);
        Self {
            id: answer.id,
            user: author,
            votes: answer.votes,
            timestamp: answer.created_at,
            html: answer.html.clone(),
            can_vote: state.can_vote(),
            has_voted: state == ViewerVote::Voted,
            question: answer.question_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommentView {
    pub id: Id,
    pub user: UserRef,
    pub answer: Id,
    pub parent: Option<Id>,
    pub timestamp: DateTime<Utc>,
    pub html: String,
    pub depth: usize,
}

impl CommentView {
    pub fn new(comment: &Comment, author: UserRef, depth: usize) -> Self {
        Self {
            id: comment.id,
            user: author,
            answer: comment.answer_id,
            parent: comment.parent_id,
            timestamp: comment.created_at,
            html: comment.html.clone(),
            depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VoteResponse {
    pub votes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    pub id: Id,
    pub privilege: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenUser {
    pub id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub privilege: u8,
    pub token: String,
    pub user: TokenUser,
}
