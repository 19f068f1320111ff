//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## What lives here:
//! - **config**: the current `AppConfig`, replaceable at runtime
//! - **metrics**: per-route request counters filled in by the middleware
//! - **sessions**: the registry of live calls
//! - **player**: the one voicemail playback controller
//! - **personas**: persona and voicemail lookup, fixed at startup
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>>
//! Many handlers read the config at the same time; an update takes the write
//! lock briefly and swaps the whole value. Getters clone so no handler holds
//! a lock while it awaits.
//!
//! ### Poisoned locks
//! A panic while holding a lock "poisons" it. The data behind these locks is
//! always left consistent (plain assignments and counters), so poisoning is
//! recovered with `into_inner()` instead of propagating the panic.
//!
//! ### Trait objects
//! The microphone, speaker, transport and synthesizer are `Arc<dyn Trait>`.
//! Production wiring and tests only differ in which implementations go in.

use crate::audio::capture::{MicrophoneSource, SimulatedMicrophone};
use crate::audio::output::{OutputDevice, VirtualOutputDevice};
use crate::audio::session::{SessionDeps, SessionManager, SessionSettings};
use crate::config::AppConfig;
use crate::persona::PersonaRegistry;
use crate::playback::PlaybackController;
use crate::synthesis::{GenerativeSpeechClient, SpeechSynthesizer};
use crate::transport::LiveTransportConnector;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::info;

/// The main application state shared across all handlers.
///
/// Cloning is cheap: every field is an `Arc` or `Copy`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub sessions: Arc<SessionManager>,
    pub player: Arc<PlaybackController>,
    pub personas: Arc<PersonaRegistry>,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// Per-route statistics keyed by "METHOD /route/{pattern}"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Counters for a single route.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl AppState {
    /// Assemble state from explicit platform pieces.
    ///
    /// ## What this does:
    /// 1. Builds the persona registry (fails on bad persona config)
    /// 2. Creates the call registry with the configured limit
    /// 3. Creates the voicemail player on the same output device
    pub fn new(
        config: AppConfig,
        deps: SessionDeps,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> anyhow::Result<Self> {
        let personas = PersonaRegistry::from_config(&config.personas, &config.voicemail).map_err(anyhow::Error::msg)?;

        let player = PlaybackController::new(
            Arc::clone(&deps.output),
            synthesizer,
            config.audio.output_sample_rate,
            config.audio.output_channels,
        );
        let sessions = SessionManager::new(
            deps,
            config.performance.max_concurrent_sessions,
            config.performance.notification_buffer,
        );

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions: Arc::new(sessions),
            player: Arc::new(player),
            personas: Arc::new(personas),
            start_time: Instant::now(),
        })
    }

    /// Production wiring: simulated microphone and virtual speaker from the
    /// audio config, live transport and speech client from the vendor config.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let microphone: MicrophoneSource = config.audio.microphone.parse().map_err(anyhow::Error::msg)?;

        let mut speaker = VirtualOutputDevice::new();
        if !config.audio.recordings_dir.is_empty() {
            speaker = speaker.with_recordings(&config.audio.recordings_dir);
        }
        let output: Arc<dyn OutputDevice> = Arc::new(speaker);

        let deps = SessionDeps {
            capture: Arc::new(SimulatedMicrophone::new(microphone)),
            output,
            connector: Arc::new(LiveTransportConnector::from_config(&config.transport)),
        };
        let synthesizer = Arc::new(GenerativeSpeechClient::from_config(&config.synthesis));

        info!(
            microphone = %config.audio.microphone,
            personas = config.personas.len(),
            recordings = !config.audio.recordings_dir.is_empty(),
            "Voice pipeline wired"
        );
        Self::new(config, deps, synthesizer)
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Settings new calls are opened with.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::from_config(&read(&self.config))
    }

    /// Validate and swap in a new configuration.
    ///
    /// Calls already running keep the settings they were opened with; the
    /// session limit and transport model apply to the next call started.
    /// `AppConfig::update_from_json` refuses the fields wired at startup.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.sessions.set_limit(new_config.performance.max_concurrent_sessions);
        *write(&self.config) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    /// Record one finished request against its route.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Hang up every call and release the voicemail player.
    pub async fn shutdown(&self) {
        let closed = self.sessions.close_all().await;
        self.player.shutdown();
        info!(closed_calls = closed, "Voice pipeline shut down");
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
