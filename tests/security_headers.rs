#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App, HttpResponse};
use pastpapers::repo::inmem::InMemRepo;
use pastpapers::storage::FsResourceStore;
use pastpapers::{config, AppState, SecurityHeaders};
use std::sync::Arc;

fn state() -> web::Data<AppState> {
    web::Data::new(AppState {
        repo: Arc::new(InMemRepo::ephemeral()),
        resources: Arc::new(FsResourceStore::new(std::env::temp_dir().join("pastpapers-no-resources"))),
        rate_limiter: None,
    })
}

#[actix_web::test]
#[serial_test::serial]
async fn test_security_headers_present() {
    std::env::remove_var("ENABLE_HSTS");
    std::env::remove_var("CSP_POLICY");
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(state())
            .configure(config)
    ).await;
    // 401 responses still carry the headers
    let req = test::TestRequest::get().uri("/api/available-papers").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    let headers = resp.headers();
    assert!(headers.get("content-security-policy").is_some());
    assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("cache-control").unwrap(), "no-store");
    assert!(headers.get("strict-transport-security").is_none()); // not enabled
}

#[actix_web::test]
#[serial_test::serial]
async fn test_env_var_enables_hsts() {
    std::env::set_var("ENABLE_HSTS", "1");
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(state())
            .configure(config)
    ).await;
    let req = test::TestRequest::get().uri("/api/available-papers").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.headers().get("strict-transport-security").is_some());
    std::env::remove_var("ENABLE_HSTS");
}

#[actix_web::test]
#[serial_test::serial]
async fn test_builder_can_disable_hsts_even_when_env_set() {
    std::env::set_var("ENABLE_HSTS", "true");
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env().with_hsts(false))
            .app_data(state())
            .configure(config)
    ).await;
    let req = test::TestRequest::get().uri("/api/available-papers").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.headers().get("strict-transport-security").is_none());
    std::env::remove_var("ENABLE_HSTS");
}

#[actix_web::test]
#[serial_test::serial]
async fn test_csp_override_and_existing_headers_kept() {
    std::env::set_var("CSP_POLICY", "default-src 'none'");
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .route("/plain", web::get().to(|| async {
                HttpResponse::Ok().insert_header(("x-frame-options", "SAMEORIGIN")).finish()
            }))
    ).await;
    let req = test::TestRequest::get().uri("/plain").to_request();
    let resp = test::call_service(&app, req).await;
    let headers = resp.headers();
    assert_eq!(headers.get("content-security-policy").unwrap(), "default-src 'none'");
    assert_eq!(headers.get("x-frame-options").unwrap(), "SAMEORIGIN");
    // outside /api responses may be cached
    assert!(headers.get("cache-control").is_none());
    std::env::remove_var("CSP_POLICY");
}
