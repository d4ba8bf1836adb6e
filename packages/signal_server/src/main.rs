#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]

mod api;
mod cors;
mod ws;

use std::{env, sync::LazyLock};

use actix_web::{App, middleware};
use api::{health_endpoint, root_endpoint};
use pairlink_env_utils::{default_env, default_env_u16, default_env_usize, option_env_usize};
use tokio::try_join;

static RELAY_SERVER_HANDLE: LazyLock<tokio::sync::RwLock<Option<ws::server::RelayServerHandle>>> =
    LazyLock::new(|| tokio::sync::RwLock::new(None));

fn main() -> Result<(), std::io::Error> {
    let service_port = {
        let args: Vec<String> = env::args().collect();

        if args.len() > 1 {
            args[1].parse::<u16>().expect("Invalid port argument")
        } else {
            default_env_u16("PORT", 8080).expect("Invalid PORT environment variable")
        }
    };

    actix_web::rt::System::with_tokio_rt(|| {
        let threads = default_env_usize("MAX_THREADS", 64).unwrap_or(64);
        log::debug!("Running with {threads} max blocking threads");
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .max_blocking_threads(threads)
            .build()
            .unwrap()
    })
    .block_on(async move {
        env_logger::init();

        let (relay_server, relay_server_handle) = ws::server::RelayServer::new();
        let relay_server = tokio::spawn(relay_server.run());

        RELAY_SERVER_HANDLE
            .write()
            .await
            .replace(relay_server_handle);

        let app = move || {
            App::new()
                .wrap(cors::middleware())
                .wrap(middleware::Compress::default())
                .service(root_endpoint)
                .service(health_endpoint)
                .service(ws::api::websocket)
        };

        let mut http_server = actix_web::HttpServer::new(app);

        if let Ok(Some(workers)) = option_env_usize("ACTIX_WORKERS") {
            log::debug!("Running with {workers} Actix workers");
            http_server = http_server.workers(workers);
        }

        let http_server = http_server
            .bind((default_env("BIND_ADDR", "0.0.0.0"), service_port))?
            .run();

        log::info!("Allowed origins: {:?}", cors::allowed_origins());
        log::info!("WebSocket signaling server started on port {service_port}");

        if let Err(err) = try_join!(
            async move {
                let resp = http_server.await;

                log::debug!("Shutting down relay server...");
                if let Some(handle) = RELAY_SERVER_HANDLE.write().await.take() {
                    handle.shutdown();
                }

                resp
            },
            async move {
                let resp = relay_server
                    .await
                    .expect("Failed to shut down relay server");
                log::debug!("RelayServer closed");
                resp
            },
        ) {
            log::error!("Error on shutdown: {err:?}");
            return Err(err);
        }

        log::debug!("Server shut down");

        Ok(())
    })
}
