use criterion::{black_box, criterion_group, criterion_main, Criterion};
use actix_web::{test, web, App, http::StatusCode};
use bigdecimal::BigDecimal;
use school_fees::api::{LoginRequest, RegisterRequest};
use school_fees::auth::SessionKeys;
use school_fees::config::{AuthConfig, BulkConfig};
use school_fees::memory::MemoryStore;
use school_fees::models::{Student, StudentFields};
use school_fees::server::handlers;
use school_fees::state::StoreStateManager;
use tokio::runtime::Runtime;
use std::sync::Arc;

fn state_manager() -> (Arc<StoreStateManager>, SessionKeys) {
    let keys = SessionKeys::new(&AuthConfig {
        session_secret: "benchmark-secret-0123456789abcdefghijkl".to_string(),
        session_hours: 1,
        secure_cookies: false,
    });
    let state = StoreStateManager::new(
        Arc::new(MemoryStore::new()),
        keys.clone(),
        BulkConfig { max_attempts: 1, base_delay_ms: 1 },
    );
    (Arc::new(state), keys)
}

fn login_integration_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (state_manager, keys) = state_manager();

    rt.block_on(async {
        state_manager
            .register(None, RegisterRequest {
                name: "Bench".to_string(),
                email: "bench@school.test".to_string(),
                password: "benchmark password".to_string(),
            })
            .await
            .expect("Failed to create benchmark admin");
    });

    let state_data = web::Data::new(state_manager);
    let keys_data = web::Data::new(keys);

    c.bench_function("admin_login_integration", |b| {
        b.iter(|| {
            rt.block_on(async {
                let app = test::init_service(
                    App::new()
                        .app_data(state_data.clone())
                        .app_data(keys_data.clone())
                        .service(handlers::admin_login)
                ).await;

                let req = test::TestRequest::post()
                    .uri("/auth")
                    .set_json(LoginRequest {
                        email: "bench@school.test".to_string(),
                        password: "benchmark password".to_string(),
                    })
                    .to_request();
                let resp = test::call_service(&app, req).await;
                assert_eq!(resp.status(), StatusCode::OK);

                black_box(test::read_body(resp).await);
            })
        });
    });
}

fn direct_payment_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (state_manager, keys) = state_manager();
    let admin_token = keys
        .issue(uuid::Uuid::new_v4(), school_fees::models::Role::Admin)
        .expect("Failed to issue benchmark token");

    let student = Student::new(StudentFields {
        name: "Bench Student".to_string(),
        roll_no: "1".to_string(),
        class_name: "10A".to_string(),
        session: "2024-25".to_string(),
        parent_name: String::new(),
        contact: String::new(),
        total_fees: BigDecimal::from(1_000_000_000i64),
    });
    rt.block_on(async {
        state_manager.store.insert_student(&student).await.expect("Failed to seed student");
    });

    let state_data = web::Data::new(state_manager);
    let keys_data = web::Data::new(keys);

    c.bench_function("direct_payment_integration", |b| {
        b.iter(|| {
            rt.block_on(async {
                let app = test::init_service(
                    App::new()
                        .app_data(state_data.clone())
                        .app_data(keys_data.clone())
                        .service(handlers::record_payment)
                ).await;

                let req = test::TestRequest::post()
                    .uri("/fees")
                    .insert_header(("Authorization", format!("Bearer {}", admin_token)))
                    .set_json(serde_json::json!({
                        "studentId": student.id,
                        "amount": 1,
                        "paymentMode": "Cash"
                    }))
                    .to_request();
                let resp = test::call_service(&app, req).await;
                assert_eq!(resp.status(), StatusCode::CREATED);

                black_box(test::read_body(resp).await);
            })
        });
    });
}

criterion_group!(benches, login_integration_benchmark, direct_payment_benchmark);
criterion_main!(benches);
