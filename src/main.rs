// Backend API server with embedded frontend
// Otobüsüm Nerde — live ESHOT bus tracker for İzmir with integrated web UI

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, Scope, middleware, web};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

mod eshot_api_models;
use eshot_api_models::{DirectionFilter, EshotApi, EshotError, TrackerSnapshot, TrackerState};

// Embed static files at compile time
const INDEX_HTML: &str = include_str!("../static/otobusumnerde.html");
const TRACKER_JS: &str = include_str!("../static/eshot-tracker.js");

#[derive(Clone)]
struct AppState {
    tracker: Arc<Mutex<TrackerState>>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: EshotApi::current_timestamp(),
            sources: vec!["ESHOT".to_string()],
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: EshotApi::current_timestamp(),
            sources: vec![],
        }
    }
}

#[derive(Deserialize)]
struct TrackRequest {
    line: String,
}

// ============================================================================
// Frontend Routes
// ============================================================================

async fn serve_index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

async fn serve_js() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/javascript; charset=utf-8")
        .body(TRACKER_JS)
}

// ============================================================================
// Tracker Refresh
// ============================================================================

/// Shared refresh path for the timer task, the track action and the manual
/// refresh route. Reads the line number, fetches with the lock released,
/// then folds the outcome back in. Overlapping refreshes are not sequenced;
/// the last one to complete determines what is displayed.
fn refresh_tracker(tracker: &Mutex<TrackerState>) -> eshot_api_models::Result<()> {
    let line_number = {
        let mut state = tracker
            .lock()
            .map_err(|e| EshotError::TransportError(format!("Failed to lock tracker state: {}", e)))?;
        if !state.has_line_number() {
            state.apply_outcome(Err(EshotError::MissingLineNumber));
            return Err(EshotError::MissingLineNumber);
        }
        state.line_number.clone()
    };

    let outcome = EshotApi::fetch_line_positions(&line_number);
    let result = match &outcome {
        Ok(buses) => {
            println!("🚌 Line {}: {} buses reported", line_number, buses.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("⚠️  Refresh failed for line {}: {}", line_number, e);
            Err(e.clone())
        }
    };

    let mut state = tracker
        .lock()
        .map_err(|e| EshotError::TransportError(format!("Failed to lock tracker state: {}", e)))?;
    state.apply_outcome(outcome);
    result
}

fn respond_with_refresh_result(
    state: &web::Data<AppState>,
    result: std::result::Result<eshot_api_models::Result<()>, tokio::task::JoinError>,
) -> HttpResponse {
    match result {
        Ok(Ok(())) => match state.tracker.lock() {
            Ok(tracker) => HttpResponse::Ok().json(ApiResponse::success(tracker.snapshot())),
            Err(e) => {
                eprintln!("❌ Failed to lock tracker state: {}", e);
                HttpResponse::InternalServerError().json(ApiResponse::<TrackerSnapshot>::error(
                    "Failed to retrieve tracker state".to_string(),
                ))
            }
        },
        Ok(Err(EshotError::MissingLineNumber)) => HttpResponse::BadRequest().json(
            ApiResponse::<TrackerSnapshot>::error(EshotError::MissingLineNumber.user_message().to_string()),
        ),
        Ok(Err(e)) => HttpResponse::InternalServerError()
            .json(ApiResponse::<TrackerSnapshot>::error(e.user_message().to_string())),
        Err(e) => {
            eprintln!("❌ Refresh task panicked: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<TrackerSnapshot>::error(
                "Refresh task panicked".to_string(),
            ))
        }
    }
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn get_state(state: web::Data<AppState>) -> HttpResponse {
    match state.tracker.lock() {
        Ok(tracker) => HttpResponse::Ok().json(ApiResponse::success(tracker.snapshot())),
        Err(e) => {
            eprintln!("❌ Failed to lock tracker state: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<TrackerSnapshot>::error(
                "Failed to retrieve tracker state".to_string(),
            ))
        }
    }
}

/// The track button. With an empty line number no request is made and the
/// previously fetched buses stay on screen.
async fn track_line(state: web::Data<AppState>, body: web::Json<TrackRequest>) -> HttpResponse {
    let line_number = body.line.trim().to_string();
    let tracker = state.tracker.clone();

    let result = tokio::task::spawn_blocking(move || -> eshot_api_models::Result<()> {
        {
            let mut tracker_state = tracker.lock().map_err(|e| {
                EshotError::TransportError(format!("Failed to lock tracker state: {}", e))
            })?;
            if line_number.is_empty() {
                tracker_state.apply_outcome(Err(EshotError::MissingLineNumber));
                return Err(EshotError::MissingLineNumber);
            }
            println!("🚏 Now tracking line {}", line_number);
            tracker_state.set_line_number(line_number);
        }
        refresh_tracker(&tracker)
    })
    .await;

    respond_with_refresh_result(&state, result)
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    println!("🔄 Manual refresh requested...");

    let tracker = state.tracker.clone();
    let result = tokio::task::spawn_blocking(move || refresh_tracker(&tracker)).await;

    respond_with_refresh_result(&state, result)
}

async fn set_direction_filter(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let raw = path.into_inner();
    let filter = match DirectionFilter::parse(&raw) {
        Some(filter) => filter,
        None => {
            return HttpResponse::BadRequest().json(ApiResponse::<TrackerSnapshot>::error(
                format!("Unknown direction filter '{}'", raw),
            ));
        }
    };

    match state.tracker.lock() {
        Ok(mut tracker) => {
            tracker.set_direction_filter(filter);
            println!("🔎 Direction filter set to {:?}", filter);
            HttpResponse::Ok().json(ApiResponse::success(tracker.snapshot()))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock tracker state: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<TrackerSnapshot>::error(
                "Failed to update direction filter".to_string(),
            ))
        }
    }
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "Otobüsüm Nerde — ESHOT Live Bus Tracker",
        "version": "0.1.0",
        "sources": ["ESHOT"],
        "timestamp": EshotApi::current_timestamp(),
        "embedded_frontend": true
    }))
}

fn api_scope() -> Scope {
    web::scope("/api/eshot")
        .route("/state", web::get().to(get_state))
        .route("/track", web::post().to(track_line))
        .route("/refresh", web::post().to(force_refresh))
        .route("/filter/{value}", web::post().to(set_direction_filter))
}

// ============================================================================
// Background Task
// ============================================================================

async fn tracker_refresh_task(tracker: Arc<Mutex<TrackerState>>) {
    let mut interval = time::interval(Duration::from_secs(EshotApi::REFRESH_INTERVAL_SECS));

    loop {
        interval.tick().await;

        // The timer only polls while a line is being tracked.
        let line_set = match tracker.lock() {
            Ok(state) => state.has_line_number(),
            Err(e) => {
                eprintln!("❌ Failed to lock tracker state: {}", e);
                false
            }
        };
        if !line_set {
            continue;
        }

        let tracker_clone = tracker.clone();
        match tokio::task::spawn_blocking(move || refresh_tracker(&tracker_clone)).await {
            Ok(Ok(())) => {
                println!(
                    "✓ Auto-refresh completed at {}",
                    EshotApi::format_timestamp_full(EshotApi::current_timestamp())
                );
            }
            Ok(Err(e)) => {
                eprintln!("⚠️  Auto-refresh failed: {}", e);
            }
            Err(e) => {
                eprintln!("❌ Auto-refresh task panicked: {}", e);
            }
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server() -> std::io::Result<()> {
    let app_state = AppState {
        tracker: Arc::new(Mutex::new(TrackerState::default())),
    };

    // Start background refresh task
    let refresh_tracker_state = app_state.tracker.clone();
    tokio::spawn(async move {
        tracker_refresh_task(refresh_tracker_state).await;
    });

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚀 Otobüsüm Nerde Server (Embedded UI)                   ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!("🌐 Server running on: http://0.0.0.0:8080");
    println!("📱 Web UI available at: http://localhost:8080");
    println!("📡 API available at: http://localhost:8080/api/eshot");
    println!("🔄 Auto-refresh: Every {} seconds while a line is tracked\n", EshotApi::REFRESH_INTERVAL_SECS);

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ Frontend:                                                   │");
    println!("│   GET  /                           - Web UI (embedded)     │");
    println!("│   GET  /eshot-tracker.js           - JavaScript (embedded) │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Tracker:                                              │");
    println!("│   GET  /api/eshot/state            - Tracker snapshot      │");
    println!("│   POST /api/eshot/track            - Track a line number   │");
    println!("│   POST /api/eshot/refresh          - Force refresh         │");
    println!("│   POST /api/eshot/filter/:value    - Set direction filter  │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Meta:                                                 │");
    println!("│   GET  /health                     - Health check          │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    println!("💡 Quick Start:");
    println!("   1. Open your browser to: http://localhost:8080");
    println!("   2. Enter a line number (e.g. 258) and press the button!");
    println!("   3. Buses refresh on the map every {} seconds\n", EshotApi::REFRESH_INTERVAL_SECS);

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            // Frontend routes
            .route("/", web::get().to(serve_index))
            .route("/eshot-tracker.js", web::get().to(serve_js))
            // Health check
            .route("/health", web::get().to(health_check))
            // API routes
            .service(api_scope())
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                                                            ║");
    println!("║    🚌 Otobüsüm Nerde — ESHOT Live Bus Tracker              ║");
    println!("║       with Embedded Web UI                                 ║");
    println!("║                                                            ║");
    println!("║    Version: 0.1.0                                          ║");
    println!("║    Data: İzmir Open Data Portal (ESHOT)                    ║");
    println!("║                                                            ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    actix_web::rt::System::new().block_on(run_server())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, http::StatusCode, test};
    use eshot_api_models::{BusPosition, Direction};

    fn seeded_state() -> AppState {
        let mut tracker = TrackerState::default();
        tracker.set_line_number("258".to_string());
        tracker.apply_outcome(Ok(vec![
            BusPosition {
                direction: Direction::Outbound,
                latitude: 38.41,
                longitude: 27.12,
            },
            BusPosition {
                direction: Direction::Inbound,
                latitude: 38.45,
                longitude: 27.20,
            },
        ]));
        AppState {
            tracker: Arc::new(Mutex::new(tracker)),
        }
    }

    #[actix_web::test]
    async fn state_endpoint_returns_snapshot() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(seeded_state()))
                .service(api_scope()),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/eshot/state").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["line_number"], "258");
        assert_eq!(body["data"]["filter"], "all");
        assert_eq!(body["data"]["buses"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["total_buses"], 2);
        assert!(body["data"]["error"].is_null());
    }

    #[actix_web::test]
    async fn filter_endpoint_narrows_visible_buses() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(seeded_state()))
                .service(api_scope()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/eshot/filter/inbound")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["filter"], "inbound");
        assert_eq!(body["data"]["buses"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["buses"][0]["direction"], "inbound");
        assert_eq!(body["data"]["total_buses"], 2);
    }

    #[actix_web::test]
    async fn unknown_filter_is_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(seeded_state()))
                .service(api_scope()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/eshot/filter/sideways")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn tracking_without_line_number_keeps_prior_buses() {
        let state = seeded_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(api_scope()),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/eshot/track")
            .set_json(serde_json::json!({ "line": "   " }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let tracker = state.tracker.lock().unwrap();
        assert_eq!(tracker.buses.len(), 2);
        assert_eq!(tracker.error, Some(EshotError::MissingLineNumber));
        assert_eq!(tracker.line_number, "258");
    }

    #[actix_web::test]
    async fn health_endpoint_is_healthy() {
        let app = test::init_service(App::new().route("/health", web::get().to(health_check))).await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["embedded_frontend"], true);
    }
}
