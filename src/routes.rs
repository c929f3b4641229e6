mod compile;

pub use compile::{CompileRequest, compile_handler};

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, get, web};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub reason: &'static str,
    pub code: u32,
    pub error_log: String,
}

impl ErrorResponse {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
            error_log: message.into(),
        }
    }
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse::invalid_argument(format!(
        "Invalid request body: {err}"
    )));
    InternalError::from_response(err, response).into()
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    time: String,
}

#[get("/health")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(Health {
        status: "ok",
        time: crate::create_timestamp(),
    })
}

/// Registers every route of the service
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource(["/compile", "/compile-latex"]).route(web::post().to(compile_handler)),
    )
    .service(health);
}
