use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::auth::AccessGate;
use crate::config::{JobConfig, ServerConfig};
use crate::routes::{configure, json_error_handler};
use crate::service::CompileService;

pub fn build_server(
    server_config: &ServerConfig,
    jobs: JobConfig,
    service: CompileService,
    gate: Arc<dyn AccessGate>,
) -> std::io::Result<Server> {
    let service = web::Data::new(service);
    let jobs = web::Data::new(jobs);
    let gate: web::Data<dyn AccessGate> = web::Data::from(gate);
    let max_body_bytes = server_config.max_body_bytes;

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .app_data(jobs.clone())
            .app_data(gate.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(max_body_bytes)
                    .error_handler(json_error_handler),
            )
            .wrap(middleware::Logger::default())
            .configure(configure)
    });
    if let Some(workers) = server_config.workers {
        server = server.workers(workers);
    }

    let address = server_config
        .bind_address
        .clone()
        .unwrap_or("127.0.0.1".to_string());
    let port = server_config.bind_port.unwrap_or(3001);
    log::info!("LaTeX compile server listening on http://{address}:{port}");

    Ok(server.bind((address, port))?.run())
}
