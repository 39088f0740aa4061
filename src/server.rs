use std::io::Write;

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, error::JsonPayloadError, middleware::Logger, post,
    web,
};
use log::info;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::io_struct::{ApiResponse, ChatRequest, VerifyRequest};
use crate::middleware::{Cors, RateLimit, RequireAuth, periodic_purge};
use crate::relay::relay_body;
use crate::relay_state::RelayState;

#[post("/chat-process", wrap = "RateLimit", wrap = "RequireAuth")]
pub async fn chat_process(
    req: web::Json<ChatRequest>,
    app_state: web::Data<RelayState>,
) -> HttpResponse {
    let request = req.into_inner();
    info!(
        "Relaying prompt ({} chars, parent={:?}) to {}",
        request.prompt.chars().count(),
        request.options.parent_message_id,
        app_state.upstream.model()
    );
    let upstream = app_state.upstream.stream_reply(request);
    HttpResponse::Ok()
        .content_type("application/octet-stream")
        .streaming(relay_body(upstream))
}

#[post("/config", wrap = "RequireAuth")]
pub async fn chat_config(app_state: web::Data<RelayState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success("", app_state.capabilities()))
}

#[post("/session")]
pub async fn session(app_state: web::Data<RelayState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success("", app_state.session()))
}

#[post("/verify")]
pub async fn verify(
    req: Option<web::Json<VerifyRequest>>,
    app_state: web::Data<RelayState>,
) -> HttpResponse {
    // a missing or unparsable body reads as a missing token
    let req = req.map(web::Json::into_inner).unwrap_or_default();
    let result = app_state.auth.verify(req.token.as_deref());
    if let Err(e) = &result {
        info!("Secret verification failed: {}", e);
    }
    HttpResponse::Ok().json(ApiResponse::from_result(result, "Verify successfully"))
}

fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    RelayError::BadRequest(err.to_string()).into()
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(chat_process)
        .service(chat_config)
        .service(session)
        .service(verify);
}

/// Registers every route twice: under `/api` and at the root.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(web::scope("/api").configure(routes))
        .configure(routes);
}

pub fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

pub async fn startup(relay_config: RelayConfig, relay_state: RelayState) -> std::io::Result<()> {
    info!(
        "Starting server at {}:{} (auth {}, {} requests/hour, model {})",
        relay_config.host,
        relay_config.port,
        if relay_state.auth.is_enabled() { "on" } else { "off" },
        relay_config.max_request_per_hour,
        relay_state.upstream.model()
    );

    actix_web::rt::spawn(periodic_purge(relay_state.limiter.clone()));
    let app_state = web::Data::new(relay_state);

    HttpServer::new(move || {
        App::new()
            .wrap(Cors)
            .wrap(Logger::default())
            .app_data(app_state.clone())
            .configure(configure)
    })
    .bind((relay_config.host, relay_config.port))?
    .run()
    .await
}
