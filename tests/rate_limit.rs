#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App};
use pastpapers::auth::{create_jwt, Role};
use pastpapers::models::{NewAnswer, NewPaper, NewQuestion, NewUserRecord};
use pastpapers::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use pastpapers::repo::inmem::InMemRepo;
use pastpapers::repo::{AnswerRepo, PaperRepo, QuestionRepo, UserRepo};
use pastpapers::storage::FsResourceStore;
use pastpapers::{config, AppState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn ensure_secret() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

fn tight_limits() -> RateLimitConfig {
    RateLimitConfig {
        post_limit: 1,
        post_window: Duration::from_secs(300),
        vote_limit: 1,
        vote_window: Duration::from_secs(300),
        login_limit: 2,
        login_window: Duration::from_secs(300),
        paper_limit: 100,
        paper_window: Duration::from_secs(300),
    }
}

fn state(repo: &InMemRepo) -> web::Data<AppState> {
    web::Data::new(AppState {
        repo: Arc::new(repo.clone()),
        resources: Arc::new(FsResourceStore::new(std::env::temp_dir().join("pastpapers-no-resources"))),
        rate_limiter: Some(RateLimiterFacade::new(InMemoryRateLimiter::new(true), tight_limits())),
    })
}

#[actix_web::test]
#[serial_test::serial]
async fn rate_limit_votes_and_posts() {
    ensure_secret();
    let repo = InMemRepo::ephemeral();
    let author = repo
        .create_user(NewUserRecord { username: "author".into(), password_hash: "x".into(), role: Role::Student })
        .await
        .unwrap();
    let voter = repo
        .create_user(NewUserRecord { username: "voter".into(), password_hash: "x".into(), role: Role::Student })
        .await
        .unwrap();
    let paper = repo
        .create_paper(NewPaper { course: "C212".into(), year: 2016, title: "Java".into(), pdf: "JVBERi0xLjQK".into() })
        .await
        .unwrap();
    let q = repo.create_questions(paper.id, vec![NewQuestion { number: "1".into() }]).await.unwrap()[0].id;
    let a1 = repo.create_answer(author.id, NewAnswer { question: q, user: None, html: "a".into() }).await.unwrap();
    let a2 = repo.create_answer(author.id, NewAnswer { question: q, user: None, html: "b".into() }).await.unwrap();
    let token = create_jwt(voter.id, "voter", vec![Role::Student]).unwrap();

    let app = test::init_service(App::new().app_data(state(&repo)).configure(config)).await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/upvote/{}", a1.id))
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);
    let req = test::TestRequest::post()
        .uri(&format!("/api/upvote/{}", a2.id))
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 429);

    // posting has its own budget
    let post = |html: &str| {
        test::TestRequest::post()
            .uri("/api/submit/answer")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .set_json(json!({"question": q, "html": html}))
            .to_request()
    };
    assert_eq!(test::call_service(&app, post("first")).await.status(), 201);
    assert_eq!(test::call_service(&app, post("second")).await.status(), 429);
}

#[actix_web::test]
#[serial_test::serial]
async fn rate_limit_login_attempts() {
    ensure_secret();
    let repo = InMemRepo::ephemeral();
    let app = test::init_service(App::new().app_data(state(&repo)).configure(config)).await;
    let attempt = || {
        test::TestRequest::post()
            .uri("/api/auth")
            .set_json(json!({"username": "ghost", "password": "guess"}))
            .to_request()
    };
    assert_eq!(test::call_service(&app, attempt()).await.status(), 404);
    assert_eq!(test::call_service(&app, attempt()).await.status(), 404);
    assert_eq!(test::call_service(&app, attempt()).await.status(), 429);
}

#[::core::prelude::v1::test]
#[serial_test::serial]
fn limiter_is_off_unless_enabled() {
    std::env::remove_var("RL_ENABLED");
    assert!(RateLimiterFacade::from_env().is_none());
    std::env::set_var("RL_ENABLED", "true");
    assert!(RateLimiterFacade::from_env().is_some());
    std::env::remove_var("RL_ENABLED");
}
