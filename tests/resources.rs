#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App};
use pastpapers::auth::{create_jwt, Role};
use pastpapers::repo::inmem::InMemRepo;
use pastpapers::storage::FsResourceStore;
use pastpapers::{config, AppState};
use serial_test::serial;
use std::sync::Arc;

const PNG: [u8; 12] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

fn token() -> String {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    create_jwt(5, "reader", vec![Role::Student]).unwrap()
}

#[actix_web::test]
#[serial]
async fn serves_attachment_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("answers/3")).unwrap();
    std::fs::write(dir.path().join("answers/3/graph.png"), PNG).unwrap();
    std::fs::create_dir_all(dir.path().join("comments/8")).unwrap();
    std::fs::write(dir.path().join("comments/8/notes.txt"), b"plain text").unwrap();
    std::fs::write(dir.path().join("secret.txt"), b"do not serve").unwrap();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(AppState {
                repo: Arc::new(InMemRepo::ephemeral()),
                resources: Arc::new(FsResourceStore::new(dir.path())),
                rate_limiter: None,
            }))
            .configure(config),
    )
    .await;
    let auth = ("Authorization", format!("Bearer {}", token()));

    let req = test::TestRequest::get().uri("/api/3/graph.png/answers").insert_header(auth.clone()).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
    assert_eq!(test::read_body(resp).await.as_ref(), &PNG[..]);

    // unknown bytes fall back to octet-stream
    let req = test::TestRequest::get().uri("/api/8/notes.txt/comments").insert_header(auth.clone()).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "application/octet-stream");

    // wrong kind, missing file, traversal
    for uri in [
        "/api/3/graph.png/comments",
        "/api/3/missing.png/answers",
        "/api/3/..%2F..%2Fsecret.txt/answers",
        "/api/3/../answers",
    ] {
        let req = test::TestRequest::get().uri(uri).insert_header(auth.clone()).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 404, "{uri}");
    }
}
