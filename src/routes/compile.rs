use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse, web};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use super::ErrorResponse;
use crate::auth::Principal;
use crate::config::JobConfig;
use crate::job::JobId;
use crate::sandbox::FailureKind;
use crate::service::{CompileError, CompileService, CompiledDocument};

#[derive(Deserialize, Debug)]
pub struct CompileRequest {
    pub source: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompileSuccess {
    success: bool,
    job_id: JobId,
    file_name: String,
    pdf_base64: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompileFailure {
    success: bool,
    reason: &'static str,
    code: u32,
    job_id: JobId,
    error: String,
    summary: String,
    error_log: String,
    error_lines: Vec<u32>,
    elapsed_ms: u64,
}

/// `POST /compile`: returns the PDF, or a report of why there is none
///
/// `Principal` is extracted first, so unauthenticated requests are turned
/// away before the body is even read.
pub async fn compile_handler(
    principal: Principal,
    service: web::Data<CompileService>,
    jobs: web::Data<JobConfig>,
    req: HttpRequest,
    body: web::Json<CompileRequest>,
) -> HttpResponse {
    log::info!("Compile request from user {principal}");

    let Some(source) = body
        .into_inner()
        .source
        .filter(|source| !source.trim().is_empty())
    else {
        return HttpResponse::BadRequest()
            .json(ErrorResponse::invalid_argument("Missing LaTeX source"));
    };

    match service.compile(source).await {
        Ok(document) => document_response(&req, document, &jobs.download_name),
        Err(e) => failure_response(e),
    }
}

fn wants_json(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

fn document_response(
    req: &HttpRequest,
    document: CompiledDocument,
    file_name: &str,
) -> HttpResponse {
    if wants_json(req) {
        return HttpResponse::Ok().json(CompileSuccess {
            success: true,
            job_id: document.job_id,
            file_name: file_name.to_string(),
            pdf_base64: STANDARD.encode(&document.bytes),
        });
    }

    HttpResponse::Ok()
        .content_type("application/pdf")
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{file_name}\""),
        ))
        .insert_header(("X-Job-Id", document.job_id.to_string()))
        .body(document.bytes)
}

fn failure_response(err: CompileError) -> HttpResponse {
    match err {
        CompileError::EmptySource(e) => {
            HttpResponse::BadRequest().json(ErrorResponse::invalid_argument(e.to_string()))
        }
        CompileError::Workspace(ref e) => {
            log::error!("Job workspace error: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                success: false,
                reason: "ERR_INTERNAL",
                code: 8,
                error_log: err.to_string(),
            })
        }
        CompileError::Aborted { .. } => HttpResponse::ServiceUnavailable().json(ErrorResponse {
            success: false,
            reason: "ERR_UNAVAILABLE",
            code: 9,
            error_log: err.to_string(),
        }),
        CompileError::Failed { job_id, report } => {
            let (reason, code) = match report.kind {
                FailureKind::Compilation => ("ERR_COMPILATION", 4),
                FailureKind::MissingArtifact => ("ERR_NO_OUTPUT", 5),
                FailureKind::TimedOut => ("ERR_TIMEOUT", 6),
                FailureKind::Spawn => ("ERR_SPAWN", 7),
            };

            HttpResponse::InternalServerError().json(CompileFailure {
                success: false,
                reason,
                code,
                job_id,
                error: report.headline.clone(),
                summary: report.summary(),
                error_log: report.error_log(),
                error_lines: report.diagnostic.error_lines(),
                elapsed_ms: u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}
