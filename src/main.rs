use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use texjob::auth::JwtGate;
use texjob::config::{CliArgs, Config};
use texjob::service::CompileService;
use texjob::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    log::info!(
        "Compiler: `{}`, timeout {} ms",
        config.compiler.command.join(" "),
        config.compiler.timeout.0
    );

    let shutdown_token = CancellationToken::new();
    let service = CompileService::build(&config, shutdown_token.clone())
        .context("Failed to prepare the job root")?;

    let Config {
        server: server_config,
        jobs: job_config,
        auth: auth_config,
        ..
    } = config;
    let secret = auth_config.jwt_secret.unwrap_or_default();
    let gate = Arc::new(JwtGate::new(secret, auth_config.leeway_secs));

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(&server_config, job_config, service, gate)
        .context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Kill running compilers so their requests finish right away
    shutdown_token.cancel();

    // 2. Stop accepting requests and let in-flight ones respond
    server_handle.stop(true).await;

    log::info!("Shutdown complete");
    Ok(())
}
