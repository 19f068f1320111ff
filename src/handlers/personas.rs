use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_personas(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "personas": state.personas.list()
    }))
}
