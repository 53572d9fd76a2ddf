use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use validator::Validate;

use crate::auth::{create_jwt, Auth, Role};
use crate::comments::CommentThread;
use crate::error::ApiError;
use crate::models::*;
use crate::papers::summarize;
use crate::password::{hash_password, verify_password};
use crate::rate_limit::RateLimiterFacade;
use crate::repo::{Repo, RepoError};
use crate::storage::{ResourceError, ResourceKind, ResourceStore};
use crate::votes::VoteDirection;

pub fn config(cfg: &mut web::ServiceConfig) {
    // Literal-prefixed routes go first so `submit`/`delete` never bind as ids.
    cfg.service(
        web::scope("/api")
            .service(web::resource("/available-papers").route(web::get().to(available_papers)))
            .service(web::resource("/auth").route(web::post().to(login)))
            .service(web::resource("/auth/refresh").route(web::post().to(refresh_token)))
            .service(web::resource("/auth/me").route(web::get().to(auth_me)))
            .service(web::resource("/register/student").route(web::post().to(register_student)))
            .service(web::resource("/register/staff").route(web::post().to(register_staff)))
            .service(web::resource("/submit/paper").route(web::post().to(submit_paper)))
            .service(web::resource("/submit/answer").route(web::post().to(submit_answer)))
            .service(web::resource("/submit/comment").route(web::post().to(submit_comment)))
            .service(web::resource("/submit/{paper_id:\\d+}/questions").route(web::post().to(submit_questions)))
            .service(web::resource("/upvote/{answer_id:\\d+}").route(web::post().to(upvote)))
            .service(web::resource("/downvote/{answer_id:\\d+}").route(web::post().to(downvote)))
            .service(web::resource("/update/answer").route(web::post().to(update_answer)))
            .service(web::resource("/update/comment").route(web::post().to(update_comment)))
            .service(web::resource("/delete/{id:\\d+}/answer").route(web::delete().to(delete_answer)))
            .service(web::resource("/delete/{id:\\d+}/comment").route(web::delete().to(delete_comment)))
            .service(web::resource("/delete/{id:\\d+}/paper").route(web::delete().to(delete_paper)))
            .service(web::resource("/{course:[A-Z][0-9]{3}}/{year:\\d+}/paper").route(web::get().to(get_paper)))
            .service(web::resource("/{course:[A-Z][0-9]{3}}/{year:\\d+}/questions").route(web::get().to(list_questions)))
            .service(web::resource("/{question_id:\\d+}/answer").route(web::get().to(list_answers)))
            .service(web::resource("/{answer_id:\\d+}/comment").route(web::get().to(list_comments)))
            .service(web::resource("/{id:\\d+}/{resource_name}/answers").route(web::get().to(answer_resource)))
            .service(web::resource("/{id:\\d+}/{resource_name}/comments").route(web::get().to(comment_resource))),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub resources: Arc<dyn ResourceStore>,
    pub rate_limiter: Option<RateLimiterFacade>,
}

impl AppState {
    fn allow(&self, check: impl Fn(&RateLimiterFacade) -> bool) -> Result<(), ApiError> {
        match &self.rate_limiter {
            Some(rl) if !check(rl) => Err(ApiError::TooManyRequests),
            _ => Ok(()),
        }
    }
}

fn current_user(auth: &Auth) -> Result<Id, ApiError> {
    auth.user_id().ok_or(ApiError::Unauthorized)
}

/// Legacy bodies name their author; it has to be the caller.
fn check_claimed_author(claimed: Option<&UserRef>, user_id: Id) -> Result<(), ApiError> {
    match claimed {
        Some(u) if u.id != user_id => {
            log::warn!("user {user_id} tried to post as user {}", u.id);
            Err(ApiError::Forbidden)
        }
        _ => Ok(()),
    }
}

/// Resolves author ids to `{id, username}` once per request.
struct Authors<'a> {
    repo: &'a dyn Repo,
    cache: HashMap<Id, UserRef>,
}

impl<'a> Authors<'a> {
    fn new(repo: &'a dyn Repo) -> Self {
        Self { repo, cache: HashMap::new() }
    }

    async fn get(&mut self, id: Id) -> Result<UserRef, ApiError> {
        if let Some(u) = self.cache.get(&id) {
            return Ok(u.clone());
        }
        let user = self.repo.get_user(id).await?;
        let r = UserRef { id: user.id, username: user.username };
        self.cache.insert(id, r.clone());
        Ok(r)
    }
}

// ---------------- papers ------------------------------------------

#[utoipa::path(
    get,
    path = "/api/available-papers",
    responses(
        (status = 200, description = "Courses keyed by code: {Name, paper_id, Years}"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn available_papers(_auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let listings = data.repo.list_papers().await?;
    Ok(HttpResponse::Ok().json(summarize(&listings)))
}

#[utoipa::path(
    get,
    path = "/api/{course}/{year}/paper",
    params(
        ("course" = String, Path, description = "Course code, e.g. C212"),
        ("year" = i32, Path, description = "Exam year")
    ),
    responses(
        (status = 200, description = "Paper document", body = PaperView),
        (status = 404, description = "No such paper")
    )
)]
pub async fn get_paper(_auth: Auth, data: web::Data<AppState>, path: web::Path<(String, i32)>) -> Result<HttpResponse, ApiError> {
    let (course, year) = path.into_inner();
    let paper = data.repo.find_paper(&course, year).await?;
    let title = data.repo.get_title(paper.title_id).await?;
    Ok(HttpResponse::Ok().json(PaperView { title: title.title, pdf: paper.pdf, paper_id: paper.id }))
}

#[utoipa::path(
    get,
    path = "/api/{course}/{year}/questions",
    params(
        ("course" = String, Path, description = "Course code"),
        ("year" = i32, Path, description = "Exam year")
    ),
    responses(
        (status = 200, description = "Questions of the paper", body = [Question]),
        (status = 404, description = "No such paper")
    )
)]
pub async fn list_questions(_auth: Auth, data: web::Data<AppState>, path: web::Path<(String, i32)>) -> Result<HttpResponse, ApiError> {
    let (course, year) = path.into_inner();
    let paper = data.repo.find_paper(&course, year).await?;
    let questions = data.repo.list_questions(paper.id).await?;
    Ok(HttpResponse::Ok().json(questions))
}

#[utoipa::path(
    post,
    path = "/api/submit/paper",
    request_body = NewPaper,
    responses(
        (status = 201, description = "Paper created", body = PaperListing),
        (status = 400, description = "Duplicate paper, title mismatch or invalid input"),
        (status = 401, description = "Unauthorized"),
        (status = 429, description = "Too many uploads")
    )
)]
pub async fn submit_paper(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewPaper>) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    data.allow(|rl| rl.allow_paper(&user_id.to_string()))?;
    let paper = data.repo.create_paper(payload.into_inner()).await?;
    let title = data.repo.get_title(paper.title_id).await?;
    log::info!("user {user_id} uploaded paper {} {} ({})", paper.course, paper.year, paper.id);
    Ok(HttpResponse::Created().json(PaperListing {
        paper_id: paper.id,
        course: paper.course,
        year: paper.year,
        title: title.title,
    }))
}

#[utoipa::path(
    post,
    path = "/api/submit/{paper_id}/questions",
    params(("paper_id" = i64, Path, description = "Paper id")),
    request_body = [NewQuestion],
    responses(
        (status = 201, description = "Questions created", body = [Question]),
        (status = 400, description = "Empty batch or duplicate question number"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "No such paper"),
        (status = 429, description = "Too many uploads")
    )
)]
pub async fn submit_questions(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<Vec<NewQuestion>>,
) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    data.allow(|rl| rl.allow_paper(&user_id.to_string()))?;
    let questions = payload.into_inner();
    if questions.is_empty() {
        return Err(ApiError::BadRequest("no questions given".into()));
    }
    for q in &questions {
        q.validate()?;
    }
    let created = data.repo.create_questions(path.into_inner(), questions).await?;
    Ok(HttpResponse::Created().json(created))
}

#[utoipa::path(
    delete,
    path = "/api/delete/{id}/paper",
    params(("id" = i64, Path, description = "Paper id")),
    responses(
        (status = 204, description = "Paper and everything under it removed"),
        (status = 403, description = "Forbidden - staff only"),
        (status = 404, description = "No such paper")
    )
)]
pub async fn delete_paper(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    crate::require_role!(auth, Role::Staff);
    let id = path.into_inner();
    data.repo.delete_paper(id).await?;
    log::info!("user {} deleted paper {id}", auth.0.sub);
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- answers -----------------------------------------

#[utoipa::path(
    get,
    path = "/api/{question_id}/answer",
    params(("question_id" = i64, Path, description = "Question id")),
    responses(
        (status = 200, description = "Answers with the caller's vote state", body = [AnswerView]),
        (status = 404, description = "No such question")
    )
)]
pub async fn list_answers(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let viewer = current_user(&auth)?;
    let question = data.repo.get_question(path.into_inner()).await?;
    let answers = data.repo.list_answers(question.id).await?;
    let mut authors = Authors::new(data.repo.as_ref());
    let mut out = Vec::with_capacity(answers.len());
    for a in &answers {
        out.push(AnswerView::new(a, authors.get(a.author_id).await?, viewer));
    }
    Ok(HttpResponse::Ok().json(out))
}

#[utoipa::path(
    post,
    path = "/api/submit/answer",
    request_body = NewAnswer,
    responses(
        (status = 201, description = "Answer created", body = AnswerView),
        (status = 403, description = "Body names a different author"),
        (status = 404, description = "No such question")
    )
)]
pub async fn submit_answer(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewAnswer>) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    let new = payload.into_inner();
    check_claimed_author(new.user.as_ref(), user_id)?;
    new.validate()?;
    data.allow(|rl| rl.allow_post(&user_id.to_string()))?;
    let answer = data.repo.create_answer(user_id, new).await?;
    let author = Authors::new(data.repo.as_ref()).get(user_id).await?;
    Ok(HttpResponse::Created().json(AnswerView::new(&answer, author, user_id)))
}

#[utoipa::path(
    post,
    path = "/api/update/answer",
    request_body = AnswerEdit,
    responses(
        (status = 200, description = "Answer updated", body = AnswerView),
        (status = 400, description = "Attempt to change a locked field"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "No such answer")
    )
)]
pub async fn update_answer(auth: Auth, data: web::Data<AppState>, payload: web::Json<AnswerEdit>) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    let answer = data.repo.update_answer(user_id, payload.into_inner()).await?;
    let author = Authors::new(data.repo.as_ref()).get(answer.author_id).await?;
    Ok(HttpResponse::Ok().json(AnswerView::new(&answer, author, user_id)))
}

#[utoipa::path(
    delete,
    path = "/api/delete/{id}/answer",
    params(("id" = i64, Path, description = "Answer id")),
    responses(
        (status = 204, description = "Answer and its comments removed"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "No such answer")
    )
)]
pub async fn delete_answer(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    data.repo.delete_answer(user_id, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- votes -------------------------------------------

async fn vote(auth: Auth, data: web::Data<AppState>, answer_id: Id, direction: VoteDirection) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    data.allow(|rl| rl.allow_vote(&user_id.to_string()))?;
    let votes = data.repo.apply_vote(answer_id, user_id, direction).await.map_err(|e| {
        if let RepoError::Vote(v) = &e {
            log::debug!("vote by {user_id} on answer {answer_id} rejected: {v}");
        }
        ApiError::from(e)
    })?;
    Ok(HttpResponse::Created().json(VoteResponse { votes }))
}

#[utoipa::path(
    post,
    path = "/api/upvote/{answer_id}",
    params(("answer_id" = i64, Path, description = "Answer id")),
    responses(
        (status = 201, description = "Vote recorded", body = VoteResponse),
        (status = 400, description = "Already voted or own answer"),
        (status = 404, description = "No such answer")
    )
)]
pub async fn upvote(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    vote(auth, data, path.into_inner(), VoteDirection::Up).await
}

#[utoipa::path(
    post,
    path = "/api/downvote/{answer_id}",
    params(("answer_id" = i64, Path, description = "Answer id")),
    responses(
        (status = 201, description = "Upvote retracted", body = VoteResponse),
        (status = 400, description = "No upvote to retract or own answer"),
        (status = 404, description = "No such answer")
    )
)]
pub async fn downvote(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    vote(auth, data, path.into_inner(), VoteDirection::Down).await
}

// ---------------- comments ----------------------------------------

#[utoipa::path(
    get,
    path = "/api/{answer_id}/comment",
    params(("answer_id" = i64, Path, description = "Answer id")),
    responses(
        (status = 200, description = "Comments in thread order", body = [CommentView]),
        (status = 404, description = "No such answer")
    )
)]
pub async fn list_comments(_auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let answer = data.repo.get_answer(path.into_inner()).await?;
    let comments = data.repo.list_comments(answer.id).await?;
    let thread = CommentThread::new(&comments);
    let mut authors = Authors::new(data.repo.as_ref());
    let mut out = Vec::with_capacity(comments.len());
    for (c, depth) in thread.in_thread_order() {
        out.push(CommentView::new(c, authors.get(c.author_id).await?, depth));
    }
    Ok(HttpResponse::Ok().json(out))
}

#[utoipa::path(
    post,
    path = "/api/submit/comment",
    request_body = NewComment,
    responses(
        (status = 201, description = "Comment created", body = CommentView),
        (status = 400, description = "Parent belongs to another answer"),
        (status = 403, description = "Body names a different author"),
        (status = 404, description = "No such answer or parent")
    )
)]
pub async fn submit_comment(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewComment>) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    let new = payload.into_inner();
    check_claimed_author(new.user.as_ref(), user_id)?;
    new.validate()?;
    data.allow(|rl| rl.allow_post(&user_id.to_string()))?;
    let comment = data.repo.create_comment(user_id, new).await?;
    let siblings = data.repo.list_comments(comment.answer_id).await?;
    let depth = CommentThread::new(&siblings).depth_of(comment.id).unwrap_or(0);
    let author = Authors::new(data.repo.as_ref()).get(user_id).await?;
    Ok(HttpResponse::Created().json(CommentView::new(&comment, author, depth)))
}

#[utoipa::path(
    post,
    path = "/api/update/comment",
    request_body = CommentEdit,
    responses(
        (status = 200, description = "Comment updated", body = CommentView),
        (status = 400, description = "Attempt to change a locked field"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "No such comment")
    )
)]
pub async fn update_comment(auth: Auth, data: web::Data<AppState>, payload: web::Json<CommentEdit>) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    let comment = data.repo.update_comment(user_id, payload.into_inner()).await?;
    let siblings = data.repo.list_comments(comment.answer_id).await?;
    let depth = CommentThread::new(&siblings).depth_of(comment.id).unwrap_or(0);
    let author = Authors::new(data.repo.as_ref()).get(comment.author_id).await?;
    Ok(HttpResponse::Ok().json(CommentView::new(&comment, author, depth)))
}

#[utoipa::path(
    delete,
    path = "/api/delete/{id}/comment",
    params(("id" = i64, Path, description = "Comment id")),
    responses(
        (status = 204, description = "Comment and its replies removed"),
        (status = 403, description = "Not the author"),
        (status = 404, description = "No such comment")
    )
)]
pub async fn delete_comment(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let user_id = current_user(&auth)?;
    data.repo.delete_comment(user_id, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- resources ---------------------------------------

async fn serve_resource(data: &AppState, kind: ResourceKind, owner: Id, name: &str) -> Result<HttpResponse, ApiError> {
    match data.resources.load(kind, owner, name).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok().content_type(mime).body(bytes)),
        Err(ResourceError::NotFound) => Err(ApiError::NotFound),
        Err(e) => {
            log::error!("resource load error: {e}");
            Err(ApiError::Internal)
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/{id}/{resource_name}/answers",
    params(
        ("id" = i64, Path, description = "Answer id"),
        ("resource_name" = String, Path, description = "File name")
    ),
    responses(
        (status = 200, description = "File bytes, content type sniffed"),
        (status = 404, description = "No such file")
    )
)]
pub async fn answer_resource(_auth: Auth, data: web::Data<AppState>, path: web::Path<(Id, String)>) -> Result<HttpResponse, ApiError> {
    let (id, name) = path.into_inner();
    serve_resource(&data, ResourceKind::Answers, id, &name).await
}

#[utoipa::path(
    get,
    path = "/api/{id}/{resource_name}/comments",
    params(
        ("id" = i64, Path, description = "Comment id"),
        ("resource_name" = String, Path, description = "File name")
    ),
    responses(
        (status = 200, description = "File bytes, content type sniffed"),
        (status = 404, description = "No such file")
    )
)]
pub async fn comment_resource(_auth: Auth, data: web::Data<AppState>, path: web::Path<(Id, String)>) -> Result<HttpResponse, ApiError> {
    let (id, name) = path.into_inner();
    serve_resource(&data, ResourceKind::Comments, id, &name).await
}

// ---------------- accounts ----------------------------------------

async fn register(data: &AppState, new: NewUser, role: Role) -> Result<HttpResponse, ApiError> {
    new.validate()?;
    let password_hash = hash_password(&new.password).map_err(|e| {
        log::error!("password hashing failed: {e}");
        ApiError::Internal
    })?;
    let user = data.repo.create_user(NewUserRecord { username: new.username, password_hash, role }).await?;
    log::info!("registered {} account '{}' ({})", role.as_str(), user.username, user.id);
    Ok(HttpResponse::Ok().json(RegisterResponse { id: user.id, privilege: role.privilege() }))
}

#[utoipa::path(
    post,
    path = "/api/register/student",
    request_body = NewUser,
    responses(
        (status = 200, description = "Account created", body = RegisterResponse),
        (status = 400, description = "Username taken or invalid input")
    )
)]
pub async fn register_student(data: web::Data<AppState>, payload: web::Json<NewUser>) -> Result<HttpResponse, ApiError> {
    register(&data, payload.into_inner(), Role::Student).await
}

/// The first staff account may register itself; after that a staff token is required.
#[utoipa::path(
    post,
    path = "/api/register/staff",
    request_body = NewUser,
    responses(
        (status = 200, description = "Account created", body = RegisterResponse),
        (status = 400, description = "Username taken or invalid input"),
        (status = 403, description = "Staff token required")
    )
)]
pub async fn register_staff(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    payload: web::Json<NewUser>,
) -> Result<HttpResponse, ApiError> {
    if data.repo.count_users_with_role(Role::Staff).await? > 0 {
        match auth {
            Some(a) if a.has_role(Role::Staff) => {}
            _ => return Err(ApiError::Forbidden),
        }
    }
    register(&data, payload.into_inner(), Role::Staff).await
}

#[utoipa::path(
    post,
    path = "/api/auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token issued", body = LoginResponse),
        (status = 401, description = "Wrong password"),
        (status = 404, description = "Unknown user"),
        (status = 429, description = "Too many attempts")
    )
)]
pub async fn login(req: HttpRequest, data: web::Data<AppState>, payload: web::Json<LoginRequest>) -> Result<HttpResponse, ApiError> {
    let peer = req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string();
    data.allow(|rl| rl.allow_login(&peer))?;
    let creds = payload.into_inner();
    let user = data.repo.find_user_by_username(&creds.username).await?;
    let ok = verify_password(&creds.password, &user.password_hash).map_err(|e| {
        log::error!("stored hash for user {} is unreadable: {e}", user.id);
        ApiError::Internal
    })?;
    if !ok {
        log::info!("failed login for '{}' from {peer}", user.username);
        return Err(ApiError::Unauthorized);
    }
    let token = create_jwt(user.id, &user.username, vec![user.role]).map_err(|e| {
        log::error!("token creation failed: {e}");
        ApiError::Internal
    })?;
    Ok(HttpResponse::Ok().json(LoginResponse {
        privilege: user.role.privilege(),
        token,
        user: TokenUser { id: user.id },
    }))
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct TokenResponse {
    token: String,
}

#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    responses(
        (status = 200, description = "Fresh token with the account's current role", body = TokenResponse),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn refresh_token(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = data.repo.get_user(current_user(&auth)?).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::Unauthorized,
        other => other.into(),
    })?;
    let token = create_jwt(user.id, &user.username, vec![user.role]).map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(TokenResponse { token }))
}

#[derive(serde::Serialize, utoipa::ToSchema)]
pub struct MeResponse {
    id: Id,
    username: String,
    role: Role,
    privilege: u8,
}

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Current user info", body = MeResponse),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn auth_me(auth: Auth) -> Result<HttpResponse, ApiError> {
    let id = current_user(&auth)?;
    let role = if auth.has_role(Role::Staff) { Role::Staff } else { Role::Student };
    Ok(HttpResponse::Ok().json(MeResponse {
        id,
        username: auth.0.username.clone(),
        role,
        privilege: role.privilege(),
    }))
}
