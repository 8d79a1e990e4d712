//! Matricula handles identity verification and secure registration for an
//! academic portal.

#[forbid(unsafe_code)]
#[deny(missing_docs, unused_mut)]
mod account;
mod audit;
mod crypto;
mod database;
pub mod error;
mod link;
mod mail;
mod router;
mod token;

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, header};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    app.oneshot(
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub registration: account::RegistrationService,
    pub policy: crypto::PasswordPolicy,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `POST /register` goes to the registration orchestrator.
        .route("/register", post(router::register::handler))
        // `GET /verify` redeems a verification link.
        .route("/verify", get(router::verify::handler))
        // `POST /verify/resend` reissues the verification mail.
        .route("/verify/resend", post(router::verify::resend))
        // Password reset, request then redeem.
        .route("/password/forgot", post(router::password::forgot))
        .route("/password/reset", post(router::password::reset))
        // `GET /lookup/:REGISTRATION` pre-fills the UI.
        .route("/lookup/{registration_number}", get(router::lookup::handler))
        .with_state(state)
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>>
{
    // read configuration file. let it in memory.
    let config = config::Configuration::default().read()?;

    // connect and migrate before the first request.
    let postgres = match config.postgres {
        Some(ref config) => database::connect(config).await?,
        None => {
            tracing::error!("missing `postgres` entry on `config.yaml` file");
            std::process::exit(0);
        },
    };

    let key =
        std::env::var("KEY").expect("missing `KEY` environnement variable");
    let salt =
        std::env::var("SALT").expect("missing `SALT` environnement variable");
    let crypto =
        Arc::new(crypto::Crypto::new(config.argon2.clone(), key, salt)?);

    let tokens = token::TokenManager::new(
        postgres.clone(),
        config.tokens.clone(),
        crypto.pepper(),
    );
    let audit = audit::AuditSink::new(postgres.clone());

    // handle mail sender.
    let mail: Arc<dyn mail::Notify> = if let Some(cfg) = &config.mail {
        Arc::new(mail::MailManager::new(cfg).await?)
    } else {
        tracing::warn!("missing `mail` entry on `config.yaml` file");
        Arc::new(mail::MailManager::default())
    };

    let registration = account::RegistrationService::new(
        postgres,
        Arc::clone(&crypto),
        tokens,
        mail,
        audit,
        Arc::clone(&config),
    );

    Ok(AppState {
        policy: crypto::PasswordPolicy::new(config.password.clone()),
        config,
        registration,
    })
}
