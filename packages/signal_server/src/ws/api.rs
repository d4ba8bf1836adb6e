use actix_web::{
    HttpResponse, Result,
    error::{ErrorBadRequest, ErrorForbidden},
    get, http,
    web::{self},
};
use serde::Deserialize;
use tokio::task::spawn_local;

use crate::RELAY_SERVER_HANDLE;
use crate::cors;
use crate::ws::handler;

#[derive(Deserialize, Clone)]
pub struct ConnectRequest {
    id: String,
}

#[get("/ws")]
pub async fn websocket(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    query: web::Query<ConnectRequest>,
) -> Result<HttpResponse, actix_web::Error> {
    if query.id.is_empty() {
        return Err(ErrorBadRequest("Missing id query parameter"));
    }

    let origin = req
        .headers()
        .get(http::header::ORIGIN)
        .and_then(|origin| origin.to_str().ok())
        .unwrap_or_default();

    if !cors::origin_allowed(cors::allowed_origins(), origin) {
        return Err(ErrorForbidden("Origin not allowed"));
    }

    let relay_server = RELAY_SERVER_HANDLE.read().await.as_ref().unwrap().clone();
    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // spawn websocket handler (and don't await it) so that the response is returned immediately
    spawn_local(handler::handle_ws(
        relay_server,
        session,
        msg_stream,
        query.id.clone(),
    ));

    Ok(res)
}
