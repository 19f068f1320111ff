//! Call control: start a call with a persona, inspect it, push system
//! directives into it and hang up.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct StartCallRequest {
    pub persona_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DirectiveRequest {
    pub text: String,
}

pub async fn start_call(
    state: web::Data<AppState>,
    body: web::Json<StartCallRequest>,
) -> AppResult<HttpResponse> {
    let profile = state
        .personas
        .get(&body.persona_id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("persona '{}'", body.persona_id)))?;

    let handle = state.sessions.start(profile, state.session_settings()).await?;
    info!(call_id = %handle.id(), persona = %body.persona_id, "Call started");

    Ok(HttpResponse::Created().json(json!({
        "call": handle.summary(),
        "events": format!("/ws/calls/{}", handle.id())
    })))
}

pub async fn list_calls(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "calls": state.sessions.list()
    }))
}

pub async fn get_call(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    let handle = state
        .sessions
        .get(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("call '{}'", call_id)))?;

    Ok(HttpResponse::Ok().json(json!({
        "call": handle.summary(),
        "report": handle.report()
    })))
}

pub async fn send_directive(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<DirectiveRequest>,
) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    if body.text.trim().is_empty() {
        return Err(AppError::BadRequest("directive text cannot be empty".to_string()));
    }
    let handle = state
        .sessions
        .get(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("call '{}'", call_id)))?;

    handle.inject(body.into_inner().text).await?;
    Ok(HttpResponse::Accepted().json(json!({
        "call_id": call_id,
        "status": "sent"
    })))
}

/// Hang up. Unknown or already closed calls answer `closed: false`.
pub async fn hang_up(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let call_id = path.into_inner();
    match state.sessions.close(&call_id).await {
        Some(report) => HttpResponse::Ok().json(json!({
            "call_id": call_id,
            "closed": true,
            "report": report
        })),
        None => HttpResponse::Ok().json(json!({
            "call_id": call_id,
            "closed": false
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::MicrophoneSource;
    use crate::state::test_support::test_app;
    use crate::transport::OutboundMessage;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;

    macro_rules! call_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .route("/calls", web::post().to(start_call))
                    .route("/calls", web::get().to(list_calls))
                    .route("/calls/{id}", web::get().to(get_call))
                    .route("/calls/{id}", web::delete().to(hang_up))
                    .route("/calls/{id}/directive", web::post().to(send_directive)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_call_round_trip() {
        let fixture = test_app(MicrophoneSource::Silence);
        let app = call_app!(fixture.state);

        let req = test::TestRequest::post()
            .uri("/calls")
            .set_json(json!({"persona_id": "boss"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        let call_id = body["call"]["call_id"].as_str().unwrap().to_string();
        assert_eq!(body["call"]["state"], "streaming");

        let mut remote = fixture.connector.take_remote().unwrap();
        assert_eq!(remote.setup.voice, "Charon");

        let req = test::TestRequest::post()
            .uri(&format!("/calls/{}/directive", call_id))
            .set_json(json!({"text": "The user is back."}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::ACCEPTED);

        let mut texts = Vec::new();
        while texts.len() < 2 {
            if let Some(OutboundMessage::Text { text, .. }) = remote.outbound.recv().await {
                texts.push(text);
            }
        }
        assert_eq!(texts[1], "The user is back.");

        let req = test::TestRequest::delete().uri(&format!("/calls/{}", call_id)).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["closed"], true);
        assert_eq!(body["report"]["active_sources"], 0);

        let req = test::TestRequest::delete().uri(&format!("/calls/{}", call_id)).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["closed"], false);
    }

    #[actix_web::test]
    async fn test_denied_microphone_is_forbidden() {
        let fixture = test_app(MicrophoneSource::Denied);
        let app = call_app!(fixture.state);

        let req = test::TestRequest::post()
            .uri("/calls")
            .set_json(json!({"persona_id": "mom"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(fixture.connector.connect_count(), 0);
    }

    #[actix_web::test]
    async fn test_unknown_persona_and_call() {
        let fixture = test_app(MicrophoneSource::Silence);
        let app = call_app!(fixture.state);

        let req = test::TestRequest::post()
            .uri("/calls")
            .set_json(json!({"persona_id": "stranger"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/calls/nope").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/calls/nope/directive")
            .set_json(json!({"text": " "}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}
