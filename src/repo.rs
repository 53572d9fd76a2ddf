use async_trait::async_trait;
use chrono::Utc;

use crate::access::authorize_edit;
use crate::auth::Role;
use crate::models::*;
use crate::papers::{resolve_title, validate_new_paper, CourseRecord, PaperError, TitleChoice};
use crate::votes::{self, VoteDirection, VoteError};

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("{0}")] Conflict(String),
    #[error("forbidden")] Forbidden,
    #[error("{0}")] Validation(String),
    #[error(transparent)] Vote(#[from] VoteError),
    #[error(transparent)] Paper(#[from] PaperError),
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create_user(&self, new: NewUserRecord) -> RepoResult<User>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    async fn find_user_by_username(&self, username: &str) -> RepoResult<User>;
    async fn count_users_with_role(&self, role: Role) -> RepoResult<usize>;
}

#[async_trait]
pub trait PaperRepo: Send + Sync {
    /// Validates, deduplicates the course title and inserts.
    async fn create_paper(&self, new: NewPaper) -> RepoResult<Paper>;
    async fn get_paper(&self, id: Id) -> RepoResult<Paper>;
    async fn find_paper(&self, course: &str, year: i32) -> RepoResult<Paper>;
    async fn get_title(&self, id: Id) -> RepoResult<PaperTitle>;
    async fn list_papers(&self) -> RepoResult<Vec<PaperListing>>;
    /// Removes the paper with its questions, answers and comments.
    async fn delete_paper(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait QuestionRepo: Send + Sync {
    /// All-or-nothing: a repeated or existing number rejects the whole batch.
    async fn create_questions(&self, paper_id: Id, new: Vec<NewQuestion>) -> RepoResult<Vec<Question>>;
    async fn list_questions(&self, paper_id: Id) -> RepoResult<Vec<Question>>;
    async fn get_question(&self, id: Id) -> RepoResult<Question>;
}

#[async_trait]
pub trait AnswerRepo: Send + Sync {
    async fn create_answer(&self, author_id: Id, new: NewAnswer) -> RepoResult<Answer>;
    async fn get_answer(&self, id: Id) -> RepoResult<Answer>;
    async fn list_answers(&self, question_id: Id) -> RepoResult<Vec<Answer>>;
    async fn update_answer(&self, editor: Id, edit: AnswerEdit) -> RepoResult<Answer>;
    async fn delete_answer(&self, editor: Id, id: Id) -> RepoResult<()>;
    /// Single atomic read-modify-write of the answer's voters and count.
    async fn apply_vote(&self, answer_id: Id, voter: Id, direction: VoteDirection) -> RepoResult<i64>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn create_comment(&self, author_id: Id, new: NewComment) -> RepoResult<Comment>;
    async fn get_comment(&self, id: Id) -> RepoResult<Comment>;
    async fn list_comments(&self, answer_id: Id) -> RepoResult<Vec<Comment>>;
    async fn update_comment(&self, editor: Id, edit: CommentEdit) -> RepoResult<Comment>;
    /// Removes the comment and every reply beneath it.
    async fn delete_comment(&self, editor: Id, id: Id) -> RepoResult<()>;
}

pub trait Repo: UserRepo + PaperRepo + QuestionRepo + AnswerRepo + CommentRepo {}

impl<T> Repo for T where T: UserRepo + PaperRepo + QuestionRepo + AnswerRepo + CommentRepo {}

fn duplicate_numbers(new: &[NewQuestion], existing: &[&str]) -> Option<String> {
    let mut seen: Vec<&str> = existing.to_vec();
    for q in new {
        if seen.contains(&q.number.as_str()) {
            return Some(q.number.clone());
        }
        seen.push(&q.number);
    }
    None
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use crate::access::can_edit;
    use crate::comments::CommentThread;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::io::Write;
    use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

    const SNAPSHOT_FILE: &str = "state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        users: HashMap<Id, User>,
        titles: HashMap<Id, PaperTitle>,
        papers: HashMap<Id, Paper>,
        questions: HashMap<Id, Question>,
        answers: HashMap<Id, Answer>,
        comments: HashMap<Id, Comment>,
        next_id: Id,
    }

    impl State {
        fn next_id(&mut self) -> Id {
            self.next_id += 1;
            self.next_id
        }

        fn course_record(&self, course: &str) -> Option<CourseRecord> {
            let mut papers: Vec<&Paper> = self.papers.values().filter(|p| p.course == course).collect();
            papers.sort_by_key(|p| p.id);
            let first = papers.first()?;
            let title = self.titles.get(&first.title_id)?.clone();
            Some(CourseRecord { years: papers.iter().map(|p| p.year).collect(), title })
        }

        fn remove_answer_cascade(&mut self, answer_id: Id) {
            self.answers.remove(&answer_id);
            self.comments.retain(|_, c| c.answer_id != answer_id);
        }
    }

    /// In-memory store persisted to a JSON snapshot after every write.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Option<Arc<PathBuf>>,
        // One snapshot writer at a time; each one serializes the newest state.
        persist_lock: Arc<Mutex<()>>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("PASTPAPERS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn load_state_from(path: &Path) -> RepoResult<State> {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let state = serde_json::from_slice::<State>(&bytes).map_err(|e| {
                        RepoError::Internal(format!("snapshot '{}' is unreadable: {e}", path.display()))
                    })?;
                    log::info!("loaded snapshot '{}'", path.display());
                    Ok(state)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::info!("no snapshot at '{}'; starting empty", path.display());
                    Ok(State::default())
                }
                Err(e) => Err(RepoError::Internal(format!("reading snapshot '{}': {e}", path.display()))),
            }
        }

        /// Snapshot under `$PASTPAPERS_DATA_DIR` (default `data/`).
        pub fn new() -> RepoResult<Self> {
            let mut path = Self::data_dir();
            path.push(SNAPSHOT_FILE);
            Self::at(path)
        }

        /// Snapshot at an explicit file path. A snapshot that exists but
        /// does not parse is an error, never an empty store.
        pub fn at(path: impl Into<PathBuf>) -> RepoResult<Self> {
            let path = path.into();
            let state = Self::load_state_from(&path)?;
            Ok(Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Some(Arc::new(path)),
                persist_lock: Arc::new(Mutex::new(())),
            })
        }

        /// Never touches disk.
        pub fn ephemeral() -> Self {
            Self {
                state: Arc::new(RwLock::new(State::default())),
                snapshot_path: None,
                persist_lock: Arc::new(Mutex::new(())),
            }
        }

        fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
            self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
            self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        // Callers must have released the write guard.
        fn persist(&self) {
            let Some(path) = self.snapshot_path.as_deref() else { return };
            let _writer = match self.persist_lock.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let bytes = match self.read().map(|s| serde_json::to_vec_pretty(&*s)) {
                Ok(Ok(b)) => b,
                Ok(Err(e)) => {
                    log::error!("failed to serialize snapshot: {e}");
                    return;
                }
                Err(e) => {
                    log::error!("failed to read state for snapshot: {e}");
                    return;
                }
            };
            if let Err(e) = write_atomically(path, &bytes) {
                log::error!("failed to write snapshot '{}': {e}", path.display());
            }
        }
    }

    /// Writes a sibling temp file and renames it over `path`, so readers
    /// only ever see a complete document.
    fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)
    }

    #[async_trait]
    impl UserRepo for InMemRepo {
        async fn create_user(&self, new: NewUserRecord) -> RepoResult<User> {
            let user = {
                let mut s = self.write()?;
                if s.users.values().any(|u| u.username == new.username) {
                    return Err(RepoError::Conflict(format!("username '{}' is taken", new.username)));
                }
                let id = s.next_id();
                let user = User {
                    id,
                    username: new.username,
                    password_hash: new.password_hash,
                    role: new.role,
                    created_at: Utc::now(),
                };
                s.users.insert(id, user.clone());
                user
            };
            self.persist();
            Ok(user)
        }
        async fn get_user(&self, id: Id) -> RepoResult<User> {
            self.read()?.users.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn find_user_by_username(&self, username: &str) -> RepoResult<User> {
            let s = self.read()?;
            s.users.values().find(|u| u.username == username).cloned().ok_or(RepoError::NotFound)
        }
        async fn count_users_with_role(&self, role: Role) -> RepoResult<usize> {
            Ok(self.read()?.users.values().filter(|u| u.role == role).count())
        }
    }

    #[async_trait]
    impl PaperRepo for InMemRepo {
        async fn create_paper(&self, new: NewPaper) -> RepoResult<Paper> {
            validate_new_paper(&new)?;
            let paper = {
                let mut s = self.write()?;
                let existing = s.course_record(&new.course);
                let title_id = match resolve_title(existing.as_ref(), &new)? {
                    TitleChoice::Reuse(id) => id,
                    TitleChoice::Create(title) => {
                        let id = s.next_id();
                        s.titles.insert(id, PaperTitle { id, title });
                        id
                    }
                };
                let id = s.next_id();
                let paper = Paper { id, course: new.course, year: new.year, title_id, pdf: new.pdf };
                s.papers.insert(id, paper.clone());
                paper
            };
            self.persist();
            Ok(paper)
        }
        async fn get_paper(&self, id: Id) -> RepoResult<Paper> {
            self.read()?.papers.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn find_paper(&self, course: &str, year: i32) -> RepoResult<Paper> {
            let s = self.read()?;
            s.papers.values().find(|p| p.course == course && p.year == year).cloned().ok_or(RepoError::NotFound)
        }
        async fn get_title(&self, id: Id) -> RepoResult<PaperTitle> {
            self.read()?.titles.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn list_papers(&self) -> RepoResult<Vec<PaperListing>> {
            let s = self.read()?;
            let mut v: Vec<PaperListing> = s.papers.values()
                .map(|p| PaperListing {
                    paper_id: p.id,
                    course: p.course.clone(),
                    year: p.year,
                    title: s.titles.get(&p.title_id).map(|t| t.title.clone()).unwrap_or_default(),
                })
                .collect();
            v.sort_by_key(|l| l.paper_id);
            Ok(v)
        }
        async fn delete_paper(&self, id: Id) -> RepoResult<()> {
            {
                let mut s = self.write()?;
                s.papers.remove(&id).ok_or(RepoError::NotFound)?;
                let question_ids: Vec<Id> = s.questions.values().filter(|q| q.paper_id == id).map(|q| q.id).collect();
                let answer_ids: Vec<Id> = s.answers.values()
                    .filter(|a| question_ids.contains(&a.question_id))
                    .map(|a| a.id)
                    .collect();
                for a in answer_ids { s.remove_answer_cascade(a); }
                s.questions.retain(|_, q| q.paper_id != id);
            }
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl QuestionRepo for InMemRepo {
        async fn create_questions(&self, paper_id: Id, new: Vec<NewQuestion>) -> RepoResult<Vec<Question>> {
            let created = {
                let mut s = self.write()?;
                if !s.papers.contains_key(&paper_id) { return Err(RepoError::NotFound); }
                let existing: Vec<&str> = s.questions.values()
                    .filter(|q| q.paper_id == paper_id)
                    .map(|q| q.number.as_str())
                    .collect();
                if let Some(dup) = duplicate_numbers(&new, &existing) {
                    return Err(RepoError::Validation(format!("question number '{dup}' of paper {paper_id} already exists")));
                }
                let mut created = Vec::with_capacity(new.len());
                for q in new {
                    let id = s.next_id();
                    let question = Question { id, paper_id, number: q.number };
                    s.questions.insert(id, question.clone());
                    created.push(question);
                }
                created
            };
            self.persist();
            Ok(created)
        }
        async fn list_questions(&self, paper_id: Id) -> RepoResult<Vec<Question>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.questions.values().filter(|q| q.paper_id == paper_id).cloned().collect();
            v.sort_by_key(|q| q.id);
            Ok(v)
        }
        async fn get_question(&self, id: Id) -> RepoResult<Question> {
            self.read()?.questions.get(&id).cloned().ok_or(RepoError::NotFound)
        }
    }

    #[async_trait]
    impl AnswerRepo for InMemRepo {
        async fn create_answer(&self, author_id: Id, new: NewAnswer) -> RepoResult<Answer> {
            let answer = {
                let mut s = self.write()?;
                if !s.questions.contains_key(&new.question) { return Err(RepoError::NotFound); }
                let id = s.next_id();
                let answer = Answer {
                    id,
                    question_id: new.question,
                    author_id,
                    votes: 0,
                    voters: Default::default(),
                    html: new.html,
                    created_at: Utc::now(),
                };
                s.answers.insert(id, answer.clone());
                answer
            };
            self.persist();
            Ok(answer)
        }
        async fn get_answer(&self, id: Id) -> RepoResult<Answer> {
            self.read()?.answers.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn list_answers(&self, question_id: Id) -> RepoResult<Vec<Answer>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.answers.values().filter(|a| a.question_id == question_id).cloned().collect();
            v.sort_by_key(|a| a.id);
            Ok(v)
        }
        async fn update_answer(&self, editor: Id, edit: AnswerEdit) -> RepoResult<Answer> {
            let updated = {
                let mut s = self.write()?;
                let answer = s.answers.get_mut(&edit.id).ok_or(RepoError::NotFound)?;
                authorize_edit(editor, &*answer, edit.locked_field())?;
                if let Some(html) = edit.html { answer.html = html; }
                answer.clone()
            };
            self.persist();
            Ok(updated)
        }
        async fn delete_answer(&self, editor: Id, id: Id) -> RepoResult<()> {
            {
                let mut s = self.write()?;
                let answer = s.answers.get(&id).ok_or(RepoError::NotFound)?;
                if !can_edit(editor, answer) { return Err(RepoError::Forbidden); }
                s.remove_answer_cascade(id);
            }
            self.persist();
            Ok(())
        }
        async fn apply_vote(&self, answer_id: Id, voter: Id, direction: VoteDirection) -> RepoResult<i64> {
            let votes = {
                let mut s = self.write()?;
                let answer = s.answers.get_mut(&answer_id).ok_or(RepoError::NotFound)?;
                votes::apply_vote(answer, voter, direction)?
            };
            self.persist();
            Ok(votes)
        }
    }

    #[async_trait]
    impl CommentRepo for InMemRepo {
        async fn create_comment(&self, author_id: Id, new: NewComment) -> RepoResult<Comment> {
            let comment = {
                let mut s = self.write()?;
                if !s.answers.contains_key(&new.answer) { return Err(RepoError::NotFound); }
                if let Some(parent_id) = new.parent {
                    let parent = s.comments.get(&parent_id).ok_or(RepoError::NotFound)?;
                    if parent.answer_id != new.answer {
                        return Err(RepoError::Validation(format!("comment {parent_id} belongs to a different answer")));
                    }
                }
                let id = s.next_id();
                let comment = Comment {
                    id,
                    answer_id: new.answer,
                    author_id,
                    parent_id: new.parent,
                    html: new.html,
                    created_at: Utc::now(),
                };
                s.comments.insert(id, comment.clone());
                comment
            };
            self.persist();
            Ok(comment)
        }
        async fn get_comment(&self, id: Id) -> RepoResult<Comment> {
            self.read()?.comments.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn list_comments(&self, answer_id: Id) -> RepoResult<Vec<Comment>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.comments.values().filter(|c| c.answer_id == answer_id).cloned().collect();
            v.sort_by_key(|c| c.id);
            Ok(v)
        }
        async fn update_comment(&self, editor: Id, edit: CommentEdit) -> RepoResult<Comment> {
            let updated = {
                let mut s = self.write()?;
                let comment = s.comments.get_mut(&edit.id).ok_or(RepoError::NotFound)?;
                authorize_edit(editor, &*comment, edit.locked_field())?;
                if let Some(html) = edit.html { comment.html = html; }
                comment.clone()
            };
            self.persist();
            Ok(updated)
        }
        async fn delete_comment(&self, editor: Id, id: Id) -> RepoResult<()> {
            {
                let mut s = self.write()?;
                let comment = s.comments.get(&id).ok_or(RepoError::NotFound)?;
                if !can_edit(editor, comment) { return Err(RepoError::Forbidden); }
                let answer_id = comment.answer_id;
                let siblings: Vec<Comment> = s.comments.values().filter(|c| c.answer_id == answer_id).cloned().collect();
                let doomed = CommentThread::new(&siblings).subtree(id);
                for c in doomed { s.comments.remove(&c); }
            }
            self.persist();
            Ok(())
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::{Pool, Postgres};

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

        pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
            sqlx::migrate!("./migrations").run(&self.pool).await
        }
    }

    fn db_err(e: sqlx::Error) -> RepoError {
        if let sqlx::Error::RowNotFound = e {
            return RepoError::NotFound;
        }
        if let Some(db) = e.as_database_error() {
            match db.code().as_deref() {
                Some("23505") => return RepoError::Conflict(db.message().to_string()),
                Some("23503") => return RepoError::NotFound, // dangling foreign key
                _ => {}
            }
        }
        log::error!("postgres error: {e}");
        RepoError::Internal(e.to_string())
    }

    #[derive(sqlx::FromRow)]
    struct UserRow {
        id: Id,
        username: String,
        password_hash: String,
        role: String,
        created_at: chrono::DateTime<Utc>,
    }

    impl TryFrom<UserRow> for User {
        type Error = RepoError;
        fn try_from(r: UserRow) -> Result<Self, Self::Error> {
            let role = Role::parse(&r.role).ok_or_else(|| RepoError::Internal(format!("unknown role '{}'", r.role)))?;
            Ok(User { id: r.id, username: r.username, password_hash: r.password_hash, role, created_at: r.created_at })
        }
    }

    #[derive(sqlx::FromRow)]
    struct AnswerRow {
        id: Id,
        question_id: Id,
        author_id: Id,
        votes: i64,
        voters: Vec<Id>,
        html: String,
        created_at: chrono::DateTime<Utc>,
    }

    impl From<AnswerRow> for Answer {
        fn from(r: AnswerRow) -> Self {
            Answer {
                id: r.id,
                question_id: r.question_id,
                author_id: r.author_id,
                votes: r.votes,
                voters: r.voters.into(),
                html: r.html,
                created_at: r.created_at,
            }
        }
    }

    const USER_COLS: &str = "id, username, password_hash, role, created_at";
    const ANSWER_COLS: &str = "id, question_id, author_id, votes, voters, html, created_at";
    const COMMENT_COLS: &str = "id, answer_id, author_id, parent_id, html, created_at";

    #[async_trait]
    impl UserRepo for PgRepo {
        async fn create_user(&self, new: NewUserRecord) -> RepoResult<User> {
            let row = sqlx::query_as::<_, UserRow>(&format!(
                "INSERT INTO users (username, password_hash, role) VALUES ($1,$2,$3) RETURNING {USER_COLS}"
            ))
            .bind(&new.username).bind(&new.password_hash).bind(new.role.as_str())
            .fetch_one(&self.pool).await
            .map_err(|e| match db_err(e) {
                RepoError::Conflict(_) => RepoError::Conflict(format!("username '{}' is taken", new.username)),
                other => other,
            })?;
            row.try_into()
        }
        async fn get_user(&self, id: Id) -> RepoResult<User> {
            sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLS} FROM users WHERE id=$1"))
                .bind(id).fetch_one(&self.pool).await.map_err(db_err)?
                .try_into()
        }
        async fn find_user_by_username(&self, username: &str) -> RepoResult<User> {
            sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLS} FROM users WHERE username=$1"))
                .bind(username).fetch_one(&self.pool).await.map_err(db_err)?
                .try_into()
        }
        async fn count_users_with_role(&self, role: Role) -> RepoResult<usize> {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role=$1")
                .bind(role.as_str()).fetch_one(&self.pool).await.map_err(db_err)?;
            Ok(n as usize)
        }
    }

    #[async_trait]
    impl PaperRepo for PgRepo {
        async fn create_paper(&self, new: NewPaper) -> RepoResult<Paper> {
            validate_new_paper(&new)?;
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            // serialise creations for the same course so the title check holds
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(&new.course).execute(&mut *tx).await.map_err(db_err)?;
            let rows = sqlx::query_as::<_, (i32, Id, String)>(
                "SELECT p.year, t.id, t.title FROM papers p JOIN paper_titles t ON t.id = p.title_id WHERE p.course=$1 ORDER BY p.id"
            )
            .bind(&new.course).fetch_all(&mut *tx).await.map_err(db_err)?;
            let existing = rows.first().map(|(_, id, title)| CourseRecord {
                years: rows.iter().map(|(y, _, _)| *y).collect(),
                title: PaperTitle { id: *id, title: title.clone() },
            });
            let title_id = match resolve_title(existing.as_ref(), &new)? {
                TitleChoice::Reuse(id) => id,
                TitleChoice::Create(title) => {
                    sqlx::query_scalar::<_, Id>("INSERT INTO paper_titles (title) VALUES ($1) RETURNING id")
                        .bind(title).fetch_one(&mut *tx).await.map_err(db_err)?
                }
            };
            let paper = sqlx::query_as::<_, Paper>(
                "INSERT INTO papers (course, year, title_id, pdf) VALUES ($1,$2,$3,$4) RETURNING id, course, year, title_id, pdf"
            )
            .bind(&new.course).bind(new.year).bind(title_id).bind(&new.pdf)
            .fetch_one(&mut *tx).await
            .map_err(|e| match db_err(e) {
                RepoError::Conflict(_) => PaperError::DuplicateExists { course: new.course.clone(), year: new.year }.into(),
                other => other,
            })?;
            tx.commit().await.map_err(db_err)?;
            Ok(paper)
        }
        async fn get_paper(&self, id: Id) -> RepoResult<Paper> {
            sqlx::query_as::<_, Paper>("SELECT id, course, year, title_id, pdf FROM papers WHERE id=$1")
                .bind(id).fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn find_paper(&self, course: &str, year: i32) -> RepoResult<Paper> {
            sqlx::query_as::<_, Paper>("SELECT id, course, year, title_id, pdf FROM papers WHERE course=$1 AND year=$2")
                .bind(course).bind(year).fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn get_title(&self, id: Id) -> RepoResult<PaperTitle> {
            sqlx::query_as::<_, PaperTitle>("SELECT id, title FROM paper_titles WHERE id=$1")
                .bind(id).fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn list_papers(&self) -> RepoResult<Vec<PaperListing>> {
            sqlx::query_as::<_, PaperListing>(
                "SELECT p.id AS paper_id, p.course, p.year, t.title FROM papers p JOIN paper_titles t ON t.id = p.title_id ORDER BY p.id"
            )
            .fetch_all(&self.pool).await.map_err(db_err)
        }
        async fn delete_paper(&self, id: Id) -> RepoResult<()> {
            // questions, answers and comments go with it via ON DELETE CASCADE
            let res = sqlx::query("DELETE FROM papers WHERE id=$1").bind(id).execute(&self.pool).await.map_err(db_err)?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            Ok(())
        }
    }

    #[async_trait]
    impl QuestionRepo for PgRepo {
        async fn create_questions(&self, paper_id: Id, new: Vec<NewQuestion>) -> RepoResult<Vec<Question>> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query_scalar::<_, Id>("SELECT id FROM papers WHERE id=$1 FOR UPDATE")
                .bind(paper_id).fetch_one(&mut *tx).await.map_err(db_err)?;
            let existing: Vec<String> = sqlx::query_scalar("SELECT number FROM questions WHERE paper_id=$1")
                .bind(paper_id).fetch_all(&mut *tx).await.map_err(db_err)?;
            let existing_refs: Vec<&str> = existing.iter().map(String::as_str).collect();
            if let Some(dup) = duplicate_numbers(&new, &existing_refs) {
                return Err(RepoError::Validation(format!("question number '{dup}' of paper {paper_id} already exists")));
            }
            let mut created = Vec::with_capacity(new.len());
            for q in new {
                let question = sqlx::query_as::<_, Question>(
                    "INSERT INTO questions (paper_id, number) VALUES ($1,$2) RETURNING id, paper_id, number"
                )
                .bind(paper_id).bind(&q.number)
                .fetch_one(&mut *tx).await.map_err(db_err)?;
                created.push(question);
            }
            tx.commit().await.map_err(db_err)?;
            Ok(created)
        }
        async fn list_questions(&self, paper_id: Id) -> RepoResult<Vec<Question>> {
            sqlx::query_as::<_, Question>("SELECT id, paper_id, number FROM questions WHERE paper_id=$1 ORDER BY id")
                .bind(paper_id).fetch_all(&self.pool).await.map_err(db_err)
        }
        async fn get_question(&self, id: Id) -> RepoResult<Question> {
            sqlx::query_as::<_, Question>("SELECT id, paper_id, number FROM questions WHERE id=$1")
                .bind(id).fetch_one(&self.pool).await.map_err(db_err)
        }
    }

    #[async_trait]
    impl AnswerRepo for PgRepo {
        async fn create_answer(&self, author_id: Id, new: NewAnswer) -> RepoResult<Answer> {
            let row = sqlx::query_as::<_, AnswerRow>(&format!(
                "INSERT INTO answers (question_id, author_id, html) VALUES ($1,$2,$3) RETURNING {ANSWER_COLS}"
            ))
            .bind(new.question).bind(author_id).bind(&new.html)
            .fetch_one(&self.pool).await.map_err(db_err)?;
            Ok(row.into())
        }
        async fn get_answer(&self, id: Id) -> RepoResult<Answer> {
            let row = sqlx::query_as::<_, AnswerRow>(&format!("SELECT {ANSWER_COLS} FROM answers WHERE id=$1"))
                .bind(id).fetch_one(&self.pool).await.map_err(db_err)?;
            Ok(row.into())
        }
        async fn list_answers(&self, question_id: Id) -> RepoResult<Vec<Answer>> {
            let rows = sqlx::query_as::<_, AnswerRow>(&format!(
                "SELECT {ANSWER_COLS} FROM answers WHERE question_id=$1 ORDER BY id"
            ))
            .bind(question_id).fetch_all(&self.pool).await.map_err(db_err)?;
            Ok(rows.into_iter().map(Answer::from).collect())
        }
        async fn update_answer(&self, editor: Id, edit: AnswerEdit) -> RepoResult<Answer> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let current: Answer = sqlx::query_as::<_, AnswerRow>(&format!(
                "SELECT {ANSWER_COLS} FROM answers WHERE id=$1 FOR UPDATE"
            ))
            .bind(edit.id).fetch_one(&mut *tx).await.map_err(db_err)?.into();
            authorize_edit(editor, &current, edit.locked_field())?;
            let row = sqlx::query_as::<_, AnswerRow>(&format!(
                "UPDATE answers SET html = COALESCE($2, html) WHERE id=$1 RETURNING {ANSWER_COLS}"
            ))
            .bind(edit.id).bind(edit.html.as_deref())
            .fetch_one(&mut *tx).await.map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(row.into())
        }
        async fn delete_answer(&self, editor: Id, id: Id) -> RepoResult<()> {
            let author: Id = sqlx::query_scalar("SELECT author_id FROM answers WHERE id=$1")
                .bind(id).fetch_one(&self.pool).await.map_err(db_err)?;
            if author != editor { return Err(RepoError::Forbidden); }
            sqlx::query("DELETE FROM answers WHERE id=$1 AND author_id=$2")
                .bind(id).bind(editor).execute(&self.pool).await.map_err(db_err)?;
            Ok(())
        }
        async fn apply_vote(&self, answer_id: Id, voter: Id, direction: VoteDirection) -> RepoResult<i64> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let mut answer: Answer = sqlx::query_as::<_, AnswerRow>(&format!(
                "SELECT {ANSWER_COLS} FROM answers WHERE id=$1 FOR UPDATE"
            ))
            .bind(answer_id).fetch_one(&mut *tx).await.map_err(db_err)?.into();
            let votes = votes::apply_vote(&mut answer, voter, direction)?;
            sqlx::query("UPDATE answers SET votes=$2, voters=$3 WHERE id=$1")
                .bind(answer_id).bind(votes).bind(answer.voters.to_vec())
                .execute(&mut *tx).await.map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(votes)
        }
    }

    #[async_trait]
    impl CommentRepo for PgRepo {
        async fn create_comment(&self, author_id: Id, new: NewComment) -> RepoResult<Comment> {
            if let Some(parent_id) = new.parent {
                let parent_answer: Id = sqlx::query_scalar("SELECT answer_id FROM comments WHERE id=$1")
                    .bind(parent_id).fetch_one(&self.pool).await.map_err(db_err)?;
                if parent_answer != new.answer {
                    return Err(RepoError::Validation(format!("comment {parent_id} belongs to a different answer")));
                }
            }
            sqlx::query_as::<_, Comment>(&format!(
                "INSERT INTO comments (answer_id, author_id, parent_id, html) VALUES ($1,$2,$3,$4) RETURNING {COMMENT_COLS}"
            ))
            .bind(new.answer).bind(author_id).bind(new.parent).bind(&new.html)
            .fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn get_comment(&self, id: Id) -> RepoResult<Comment> {
            sqlx::query_as::<_, Comment>(&format!("SELECT {COMMENT_COLS} FROM comments WHERE id=$1"))
                .bind(id).fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn list_comments(&self, answer_id: Id) -> RepoResult<Vec<Comment>> {
            sqlx::query_as::<_, Comment>(&format!(
                "SELECT {COMMENT_COLS} FROM comments WHERE answer_id=$1 ORDER BY id"
            ))
            .bind(answer_id).fetch_all(&self.pool).await.map_err(db_err)
        }
        async fn update_comment(&self, editor: Id, edit: CommentEdit) -> RepoResult<Comment> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let current = sqlx::query_as::<_, Comment>(&format!(
                "SELECT {COMMENT_COLS} FROM comments WHERE id=$1 FOR UPDATE"
            ))
            .bind(edit.id).fetch_one(&mut *tx).await.map_err(db_err)?;
            authorize_edit(editor, &current, edit.locked_field())?;
            let updated = sqlx::query_as::<_, Comment>(&format!(
                "UPDATE comments SET html = COALESCE($2, html) WHERE id=$1 RETURNING {COMMENT_COLS}"
            ))
            .bind(edit.id).bind(edit.html.as_deref())
            .fetch_one(&mut *tx).await.map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(updated)
        }
        async fn delete_comment(&self, editor: Id, id: Id) -> RepoResult<()> {
            let author: Id = sqlx::query_scalar("SELECT author_id FROM comments WHERE id=$1")
                .bind(id).fetch_one(&self.pool).await.map_err(db_err)?;
            if author != editor { return Err(RepoError::Forbidden); }
            // replies cascade through comments.parent_id
            sqlx::query("DELETE FROM comments WHERE id=$1").bind(id).execute(&self.pool).await.map_err(db_err)?;
            Ok(())
        }
    }
}
