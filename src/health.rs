use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let active_calls = state.sessions.active_count();
    let playback = state.player.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-session-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(metrics.error_count, metrics.request_count),
            "active_calls": active_calls
        },
        "pipeline": {
            "transport_model": config.transport.model,
            "transport_key_configured": config.transport.api_key().is_some(),
            "synthesis_model": config.synthesis.model,
            "synthesis_key_configured": config.synthesis.api_key().is_some(),
            "microphone": config.audio.microphone,
            "voicemail_playback": playback.state
        },
        "memory": get_memory_info(),
        "system": get_system_status(active_calls, state.sessions.limit())
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(metrics.error_count, metrics.request_count),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "calls": {
            "active": state.sessions.active_count(),
            "max_concurrent_sessions": state.sessions.limit()
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn error_rate(errors: u64, requests: u64) -> f64 {
    if requests > 0 {
        errors as f64 / requests as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(active_calls: usize, max_calls: usize) -> serde_json::Value {
    let usage = if max_calls > 0 {
        active_calls as f64 / max_calls as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "at_capacity"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (usage * 100.0).round(),
        "max_calls": max_calls,
        "current_calls": active_calls
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_status_levels() {
        assert_eq!(get_system_status(0, 4)["status"], "normal");
        assert_eq!(get_system_status(3, 4)["status"], "moderate_load");
        assert_eq!(get_system_status(4, 4)["status"], "at_capacity");
        assert_eq!(get_system_status(1, 0)["call_usage_percent"], 0.0);
    }

    #[test]
    fn test_error_rate_handles_no_requests() {
        assert_eq!(error_rate(0, 0), 0.0);
        assert_eq!(error_rate(1, 4), 0.25);
    }
}
