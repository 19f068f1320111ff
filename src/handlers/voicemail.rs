use crate::error::{AppError, AppResult};
use crate::persona::VoicemailEntry;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

fn find_entry(state: &AppState, id: &str) -> AppResult<VoicemailEntry> {
    state
        .personas
        .voicemail(id)
        .ok_or_else(|| AppError::NotFound(format!("voicemail '{}'", id)))
}

pub async fn list_voicemail(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "items": state.personas.voicemails(),
        "playback": state.player.snapshot()
    }))
}

/// Play an item from the start. Synthesis failures come back as
/// `outcome: "failed"` with 200, the player is idle again either way.
pub async fn play_voicemail(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let entry = find_entry(&state, &path)?;
    let outcome = state.player.play(&entry).await;
    Ok(HttpResponse::Ok().json(json!({
        "result": outcome,
        "playback": state.player.snapshot()
    })))
}

pub async fn toggle_voicemail(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let entry = find_entry(&state, &path)?;
    let outcome = state.player.toggle(&entry).await;
    Ok(HttpResponse::Ok().json(json!({
        "result": outcome,
        "playback": state.player.snapshot()
    })))
}

pub async fn stop_voicemail(state: web::Data<AppState>) -> HttpResponse {
    let stopped = state.player.stop();
    HttpResponse::Ok().json(json!({
        "stopped": stopped,
        "playback": state.player.snapshot()
    }))
}

pub async fn playback_state(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.player.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::MicrophoneSource;
    use crate::state::test_support::test_app;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_play_toggle_stop() {
        let fixture = test_app(MicrophoneSource::Silence);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(fixture.state.clone()))
                .route("/voicemail", web::get().to(list_voicemail))
                .route("/voicemail/stop", web::post().to(stop_voicemail))
                .route("/voicemail/playback", web::get().to(playback_state))
                .route("/voicemail/{id}/play", web::post().to(play_voicemail))
                .route("/voicemail/{id}/toggle", web::post().to(toggle_voicemail)),
        )
        .await;

        let body: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/voicemail").to_request()).await;
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        assert_eq!(body["playback"]["state"], "idle");

        let req = test::TestRequest::post().uri("/voicemail/vm-mom-1/play").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"]["outcome"], "playing");
        assert_eq!(body["playback"]["item_id"], "vm-mom-1");

        let req = test::TestRequest::post().uri("/voicemail/vm-mom-1/toggle").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"]["outcome"], "stopped");
        assert_eq!(body["playback"]["is_playing"], false);

        // second play comes from the cache
        let req = test::TestRequest::post().uri("/voicemail/vm-mom-1/toggle").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"]["outcome"], "playing");
        assert_eq!(fixture.synthesizer.calls(), 1);

        let req = test::TestRequest::post().uri("/voicemail/stop").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["stopped"], true);

        let req = test::TestRequest::post().uri("/voicemail/stop").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["stopped"], false);
    }

    #[actix_web::test]
    async fn test_unknown_item_is_not_found() {
        let fixture = test_app(MicrophoneSource::Silence);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(fixture.state.clone()))
                .route("/voicemail/{id}/play", web::post().to(play_voicemail)),
        )
        .await;

        let req = test::TestRequest::post().uri("/voicemail/vm-nobody/play").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
