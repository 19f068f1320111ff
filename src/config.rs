//! # Configuration Management
//!
//! This module loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Deployment shortcuts (HOST, PORT, GEMINI_API_KEY)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: converts between these structs and TOML, JSON and env vars
//! - **Builder pattern**: `config::Config::builder()` layers the sources
//! - **Result<T, E>**: every loading step can fail and is propagated with `?`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `GEMINI_API_KEY`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUDIO__FRAME_SIZE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::capture::MicrophoneSource;
use crate::audio::codec::SampleConversion;
use crate::persona::{PersonaRegistry, VoiceProfile, VoicemailItem};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
///
/// ## Sections:
/// - **server**: where the control API listens
/// - **performance**: call limits and notification buffering
/// - **audio**: capture and playback formats
/// - **transport**: the live conversational endpoint
/// - **synthesis**: the one-shot speech endpoint
/// - **personas / voicemail**: who can call and what they left behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub performance: PerformanceConfig,
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub synthesis: SynthesisConfig,
    pub personas: Vec<VoiceProfile>,
    pub voicemail: Vec<VoicemailItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: calls allowed at the same time
/// - `notification_buffer`: events kept per call for slow listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub notification_buffer: usize,
}

/// Audio format settings.
///
/// ## Common values:
/// - Capture at 16kHz mono in 4096-sample frames (~256ms per frame)
/// - Playback at 24kHz, the rate the speech services answer with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub input_channels: u16,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    /// Frames per captured block, a power of two
    pub frame_size: usize,
    /// How out-of-range samples are encoded: "clamp" or "wrap"
    pub uplink_overflow: SampleConversion,
    /// `silence`, `tone:<hz>`, `denied` or a WAV file path
    pub microphone: String,
    /// Directory for WAV recordings of played audio, empty disables them
    pub recordings_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
}

impl TransportConfig {
    pub fn api_key(&self) -> Option<String> {
        non_empty(&self.api_key)
    }
}

impl SynthesisConfig {
    pub fn api_key(&self) -> Option<String> {
        non_empty(&self.api_key)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn default_personas() -> Vec<VoiceProfile> {
    vec![
        VoiceProfile {
            id: "mom".to_string(),
            display_name: "Mom".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "You are the user's mother calling to check in. Keep replies short and warm."
                .to_string(),
            greeting: "Greet your child and ask how their day is going.".to_string(),
        },
        VoiceProfile {
            id: "boss".to_string(),
            display_name: "The Boss".to_string(),
            voice: "Charon".to_string(),
            system_instruction: "You are the user's manager calling about a deadline. Be brief and direct."
                .to_string(),
            greeting: "Say hello and mention you are calling about the report.".to_string(),
        },
        VoiceProfile {
            id: "support".to_string(),
            display_name: "Customer Support".to_string(),
            voice: "Puck".to_string(),
            system_instruction: "You are a friendly support agent returning the user's call.".to_string(),
            greeting: "Introduce yourself and ask how you can help.".to_string(),
        },
    ]
}

fn default_voicemail() -> Vec<VoicemailItem> {
    vec![
        VoicemailItem {
            id: "vm-mom-1".to_string(),
            persona_id: "mom".to_string(),
            text: "Hi sweetie, it's Mom. Just calling to say hello. Call me back when you can.".to_string(),
            voice: String::new(),
        },
        VoicemailItem {
            id: "vm-boss-1".to_string(),
            persona_id: "boss".to_string(),
            text: "Hey, it's me. I need the quarterly numbers by Friday. Thanks.".to_string(),
            voice: String::new(),
        },
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 4,
                notification_buffer: 256,
            },
            audio: AudioConfig {
                input_sample_rate: 16000,
                input_channels: 1,
                output_sample_rate: 24000,
                output_channels: 1,
                frame_size: crate::audio::buffer::DEFAULT_FRAME_SIZE,
                uplink_overflow: SampleConversion::Clamp,
                microphone: "silence".to_string(),
                recordings_dir: String::new(),
            },
            transport: TransportConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
                    .to_string(),
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                api_key: String::new(),
            },
            synthesis: SynthesisConfig {
                endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                model: "gemini-2.5-flash-preview-tts".to_string(),
                api_key: String::new(),
            },
            personas: default_personas(),
            voicemail: default_voicemail(),
        }
    }
}

/// Settings wired into long-lived objects when the server starts. A runtime
/// update naming one of them is refused. `None` covers the whole section.
pub const STARTUP_ONLY_FIELDS: [(&str, Option<&str>); 9] = [
    ("server", None),
    ("personas", None),
    ("voicemail", None),
    ("performance", Some("notification_buffer")),
    ("audio", Some("microphone")),
    ("audio", Some("recordings_dir")),
    ("transport", Some("api_key")),
    ("synthesis", Some("model")),
    ("synthesis", Some("api_key")),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: override server host
    /// - `APP_AUDIO__UPLINK_OVERFLOW=wrap`: encode like a typed-array store
    /// - `APP_AUDIO__MICROPHONE=tone:440`: simulated microphone source
    /// - `HOST` / `PORT`: deployment platform conventions
    /// - `GEMINI_API_KEY`: fills both API keys when they are not set
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // double underscore separates sections so single underscores can
            // stay inside field names
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;
        config.apply_shared_api_key(env::var("GEMINI_API_KEY").ok());
        Ok(config)
    }

    /// Use one key for both vendor endpoints unless they have their own.
    pub fn apply_shared_api_key(&mut self, key: Option<String>) {
        let Some(key) = key.and_then(|key| non_empty(&key)) else {
            return;
        };
        if self.transport.api_key().is_none() {
            self.transport.api_key = key.clone();
        }
        if self.synthesis.api_key().is_none() {
            self.synthesis.api_key = key;
        }
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one call may run, notifications have some buffer
    /// - Frame size is a power of two between 256 and 16384
    /// - Sample rates and channel counts are non-zero
    /// - The microphone source parses
    /// - Persona ids are unique and voicemail points at known personas
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.notification_buffer == 0 {
            return Err(anyhow::anyhow!("Notification buffer must be greater than 0"));
        }

        let frame_size = self.audio.frame_size;
        if !frame_size.is_power_of_two() || !(256..=16384).contains(&frame_size) {
            return Err(anyhow::anyhow!(
                "Frame size must be a power of two between 256 and 16384, got {}",
                frame_size
            ));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.input_channels == 0 || self.audio.output_channels == 0 {
            return Err(anyhow::anyhow!("Channel counts must be greater than 0"));
        }

        self.audio
            .microphone
            .parse::<MicrophoneSource>()
            .map_err(|e| anyhow::anyhow!(e))?;

        PersonaRegistry::from_config(&self.personas, &self.voicemail).map_err(|e| anyhow::anyhow!(e))?;

        Ok(())
    }

    /// Update configuration from a JSON string (runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed, e.g.
    /// `{"audio": {"uplink_overflow": "wrap"}}`. The updatable fields are
    /// `performance.max_concurrent_sessions`, `audio.uplink_overflow` and
    /// `transport.model`; all of them apply to calls started afterwards.
    /// Fields read only at startup (see [`STARTUP_ONLY_FIELDS`]) are rejected
    /// instead of being stored without effect.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        for (section, field) in STARTUP_ONLY_FIELDS {
            let present = match field {
                Some(field) => partial_config.get(section).and_then(|s| s.get(field)).is_some(),
                None => partial_config.get(section).is_some(),
            };
            if present {
                let name = field.map(|f| format!("{}.{}", section, f)).unwrap_or_else(|| section.to_string());
                return Err(anyhow::anyhow!("{} is read at startup and cannot be changed at runtime", name));
            }
        }

        if let Some(sessions) = partial_config
            .get("performance")
            .and_then(|p| p.get("max_concurrent_sessions"))
            .and_then(|v| v.as_u64())
        {
            self.performance.max_concurrent_sessions = sessions as usize;
        }

        if let Some(policy) = partial_config
            .get("audio")
            .and_then(|a| a.get("uplink_overflow"))
            .and_then(|v| v.as_str())
        {
            self.audio.uplink_overflow = policy.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        }

        if let Some(model) = partial_config
            .get("transport")
            .and_then(|t| t.get("model"))
            .and_then(|v| v.as_str())
        {
            self.transport.model = model.to_string();
        }

        self.validate()?;
        Ok(())
    }

    /// Copy safe to hand out over the API, with API keys masked.
    pub fn redacted(&self) -> AppConfig {
        let mut config = self.clone();
        for key in [&mut config.transport.api_key, &mut config.synthesis.api_key] {
            if !key.is_empty() {
                *key = "********".to_string();
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.frame_size, 4096);
        assert_eq!(config.audio.uplink_overflow, SampleConversion::Clamp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_size = 4000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_size = 32768;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.output_channels = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.voicemail[0].persona_id = "nobody".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 2}, "audio": {"uplink_overflow": "wrap"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.performance.max_concurrent_sessions, 2);
        assert_eq!(config.audio.uplink_overflow, SampleConversion::Wrap);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_bad_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"audio": {"uplink_overflow": "round"}}"#).is_err());
        assert!(config.update_from_json(r#"{"performance": {"max_concurrent_sessions": 0}}"#).is_err());
    }

    #[test]
    fn test_config_update_refuses_startup_only_fields() {
        let mut config = AppConfig::default();
        for json in [
            r#"{"audio": {"microphone": "tone:220"}}"#,
            r#"{"synthesis": {"model": "other-tts"}}"#,
            r#"{"performance": {"notification_buffer": 8}}"#,
            r#"{"server": {"port": 9090}}"#,
        ] {
            let err = config.update_from_json(json).unwrap_err();
            assert!(err.to_string().contains("cannot be changed at runtime"), "{}", json);
        }
        assert_eq!(config.audio.microphone, "silence");
        assert_eq!(config.server.port, AppConfig::default().server.port);

        // a refused field also blocks the allowed ones next to it
        let json = r#"{"audio": {"uplink_overflow": "wrap", "microphone": "denied"}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.audio.uplink_overflow, SampleConversion::Clamp);
    }

    #[test]
    fn test_shared_api_key_fills_only_missing_keys() {
        let mut config = AppConfig::default();
        config.synthesis.api_key = "own-key".to_string();
        config.apply_shared_api_key(Some("shared".to_string()));
        assert_eq!(config.transport.api_key, "shared");
        assert_eq!(config.synthesis.api_key, "own-key");

        let mut config = AppConfig::default();
        config.apply_shared_api_key(Some("  ".to_string()));
        assert!(config.transport.api_key().is_none());
    }

    #[test]
    fn test_redacted_masks_keys() {
        let mut config = AppConfig::default();
        config.transport.api_key = "secret".to_string();
        let redacted = config.redacted();
        assert_eq!(redacted.transport.api_key, "********");
        assert_eq!(redacted.synthesis.api_key, "");
    }

    #[test]
    fn test_defaults_survive_config_crate_round_trip() {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.personas.len(), 3);
        assert_eq!(config.voicemail[0].persona_id, "mom");
        assert!(config.validate().is_ok());
    }
}
