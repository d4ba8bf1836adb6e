use actix_web::{Result, route, web::Json};
use log::info;
use serde_json::{Value, json};

#[route("/", method = "GET")]
pub async fn root_endpoint() -> Result<Json<Value>> {
    Ok(Json(json!({"Hello": "World"})))
}

#[route("/health", method = "GET")]
pub async fn health_endpoint() -> Result<Json<Value>> {
    info!("Healthy");
    Ok(Json(json!({"healthy": true})))
}
