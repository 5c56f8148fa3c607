use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: std::sync::Arc<services::AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any); // TODO: restrict to specific origins in production

    Router::new()
        .route("/health", get(handlers::health_check))
        // Metrics endpoint with Basic Auth protection
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/api/feedback", feedback_routes())
        .nest("/api/rubrics", rubric_routes())
        .nest("/api/submissions", submission_routes())
        .nest("/api/teacher-grades", teacher_grade_routes())
        .with_state(app_state)
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn feedback_routes() -> Router<std::sync::Arc<services::AppState>> {
    Router::new()
        .route("/generate", post(handlers::feedback::generate))
        .route("/status/{answer_id}", get(handlers::feedback::status))
        .route("/retry-all", post(handlers::feedback::retry_all))
        .route("/{answer_id}", get(handlers::feedback::get_feedback))
        .route("/{answer_id}/retry", post(handlers::feedback::retry))
}

fn rubric_routes() -> Router<std::sync::Arc<services::AppState>> {
    Router::new().route(
        "/{module_id}",
        get(handlers::rubrics::get_rubric).put(handlers::rubrics::put_rubric),
    )
}

fn submission_routes() -> Router<std::sync::Arc<services::AppState>> {
    Router::new()
        .route("/", post(handlers::submissions::create_submission))
        .route(
            "/{student_id}/{module_id}/{attempt}",
            get(handlers::submissions::get_submission),
        )
}

fn teacher_grade_routes() -> Router<std::sync::Arc<services::AppState>> {
    Router::new().route("/", post(handlers::teacher_grades::create_teacher_grade))
}
