use crate::auth::Role;
use crate::models::{
    AnswerEdit, AnswerView, CommentEdit, CommentView, CourseSummary, LoginRequest, LoginResponse,
    NewAnswer, NewComment, NewPaper, NewQuestion, NewUser, PaperListing, PaperView, Question,
    RegisterResponse, TokenUser, UserRef, VoteResponse,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::available_papers,
        crate::routes::get_paper,
        crate::routes::list_questions,
        crate::routes::submit_paper,
        crate::routes::submit_questions,
        crate::routes::delete_paper,
        crate::routes::list_answers,
        crate::routes::submit_answer,
        crate::routes::update_answer,
        crate::routes::delete_answer,
        crate::routes::upvote,
        crate::routes::downvote,
        crate::routes::list_comments,
        crate::routes::submit_comment,
        crate::routes::update_comment,
        crate::routes::delete_comment,
        crate::routes::answer_resource,
        crate::routes::comment_resource,
        crate::routes::register_student,
        crate::routes::register_staff,
        crate::routes::login,
        crate::routes::refresh_token,
        crate::routes::auth_me,
    ),
    components(schemas(
        NewPaper, PaperListing, PaperView, CourseSummary, NewQuestion, Question,
        NewAnswer, AnswerEdit, AnswerView, NewComment, CommentEdit, CommentView,
        UserRef, VoteResponse, NewUser, RegisterResponse, LoginRequest, LoginResponse,
        TokenUser, Role, crate::routes::TokenResponse, crate::routes::MeResponse
    )),
    tags(
        (name = "papers", description = "Papers and questions"),
        (name = "answers", description = "Answers, votes and comments"),
        (name = "accounts", description = "Registration and tokens"),
    )
)]
pub struct ApiDoc;
