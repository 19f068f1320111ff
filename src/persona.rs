//! # Personas and Voicemail
//!
//! Who is on the other end of a call. Every persona is looked up by a stable
//! identifier and carries its own voice, persona instruction and the greeting
//! turn that primes the call. Voicemail items point at a persona by id and
//! inherit its voice unless they override it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Voice configuration of one caller persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub id: String,
    pub display_name: String,
    /// Prebuilt voice name understood by the speech service
    pub voice: String,
    pub system_instruction: String,
    /// Text turn sent before any user audio
    pub greeting: String,
}

/// A pre-recorded message, synthesized on first playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicemailItem {
    pub id: String,
    pub persona_id: String,
    pub text: String,
    /// Voice override, empty means the persona's voice
    #[serde(default)]
    pub voice: String,
}

/// A voicemail item with its persona resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoicemailEntry {
    pub id: String,
    pub persona_id: String,
    pub from: String,
    pub text: String,
    pub voice: String,
}

/// Lookup table for personas and voicemail, built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct PersonaRegistry {
    personas: Vec<VoiceProfile>,
    by_id: HashMap<String, usize>,
    voicemail: Vec<VoicemailItem>,
}

impl PersonaRegistry {
    /// Build the registry, rejecting duplicate ids and voicemail items that
    /// reference unknown personas.
    pub fn from_config(personas: &[VoiceProfile], voicemail: &[VoicemailItem]) -> Result<Self, String> {
        let mut by_id = HashMap::new();
        for (index, persona) in personas.iter().enumerate() {
            if persona.id.trim().is_empty() {
                return Err("Persona id cannot be empty".to_string());
            }
            if by_id.insert(persona.id.clone(), index).is_some() {
                return Err(format!("Duplicate persona id: {}", persona.id));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for item in voicemail {
            if !seen.insert(item.id.as_str()) {
                return Err(format!("Duplicate voicemail id: {}", item.id));
            }
            if !by_id.contains_key(&item.persona_id) {
                return Err(format!(
                    "Voicemail '{}' references unknown persona '{}'",
                    item.id, item.persona_id
                ));
            }
        }

        Ok(Self {
            personas: personas.to_vec(),
            by_id,
            voicemail: voicemail.to_vec(),
        })
    }

    pub fn get(&self, id: &str) -> Option<&VoiceProfile> {
        self.by_id.get(id).map(|&index| &self.personas[index])
    }

    pub fn list(&self) -> &[VoiceProfile] {
        &self.personas
    }

    pub fn voicemail(&self, id: &str) -> Option<VoicemailEntry> {
        let item = self.voicemail.iter().find(|item| item.id == id)?;
        self.resolve(item)
    }

    pub fn voicemails(&self) -> Vec<VoicemailEntry> {
        self.voicemail.iter().filter_map(|item| self.resolve(item)).collect()
    }

    fn resolve(&self, item: &VoicemailItem) -> Option<VoicemailEntry> {
        let persona = self.get(&item.persona_id)?;
        let voice = if item.voice.is_empty() {
            persona.voice.clone()
        } else {
            item.voice.clone()
        };
        Some(VoicemailEntry {
            id: item.id.clone(),
            persona_id: persona.id.clone(),
            from: persona.display_name.clone(),
            text: item.text.clone(),
            voice,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(id: &str, name: &str, voice: &str) -> VoiceProfile {
        VoiceProfile {
            id: id.to_string(),
            display_name: name.to_string(),
            voice: voice.to_string(),
            system_instruction: format!("You are {}.", name),
            greeting: "Say hello.".to_string(),
        }
    }

    fn item(id: &str, persona_id: &str, voice: &str) -> VoicemailItem {
        VoicemailItem {
            id: id.to_string(),
            persona_id: persona_id.to_string(),
            text: "Call me back.".to_string(),
            voice: voice.to_string(),
        }
    }

    #[test]
    fn test_lookup_is_by_id_not_display_name() {
        let registry = PersonaRegistry::from_config(
            &[persona("mom", "Mom", "Kore"), persona("mom-work", "Mom (Work)", "Charon")],
            &[],
        )
        .unwrap();

        assert_eq!(registry.get("mom").unwrap().voice, "Kore");
        assert_eq!(registry.get("mom-work").unwrap().voice, "Charon");
        assert!(registry.get("Mom").is_none());
        assert!(registry.get("mo").is_none());
    }

    #[test]
    fn test_voicemail_inherits_or_overrides_voice() {
        let registry = PersonaRegistry::from_config(
            &[persona("boss", "The Boss", "Charon")],
            &[item("vm-1", "boss", ""), item("vm-2", "boss", "Fenrir")],
        )
        .unwrap();

        let first = registry.voicemail("vm-1").unwrap();
        assert_eq!(first.voice, "Charon");
        assert_eq!(first.from, "The Boss");
        assert_eq!(registry.voicemail("vm-2").unwrap().voice, "Fenrir");
        assert_eq!(registry.voicemails().len(), 2);
        assert!(registry.voicemail("vm-3").is_none());
    }

    #[test]
    fn test_rejects_duplicates_and_dangling_references() {
        assert!(PersonaRegistry::from_config(&[persona("a", "A", "Puck"), persona("a", "B", "Puck")], &[]).is_err());
        assert!(PersonaRegistry::from_config(&[persona("a", "A", "Puck")], &[item("vm", "ghost", "")]).is_err());
        assert!(PersonaRegistry::from_config(
            &[persona("a", "A", "Puck")],
            &[item("vm", "a", ""), item("vm", "a", "")]
        )
        .is_err());
    }
}
