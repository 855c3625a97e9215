//! # Interview Modes
//!
//! A session's mode selects the persona the upstream model speaks with.
//! Modes come from a JSON prompts file when one is configured, otherwise
//! from the built-in catalog below.
//!
//! ## Prompts File Format:
//! ```json
//! {
//!   "amazon_interviewer": {
//!     "name": "Amazon Technical Interviewer",
//!     "system_instruction": "You are ...",
//!     "welcome_message": "Amazon Interview Mode",
//!     "description": "Technical + Leadership Principles",
//!     "greeting": "Start the interview with a brief greeting ..."
//!   }
//! }
//! ```

use crate::upstream::SessionProfile;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Appended to every system instruction; keeps replies suitable for voice.
const REALTIME_RULES: &str = "\n\nThis is a real-time spoken conversation. Keep each reply short and \
conversational, ask one question at a time, and stop talking as soon as the candidate starts speaking.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeProfile {
    pub name: String,
    pub system_instruction: String,
    #[serde(default)]
    pub welcome_message: String,
    #[serde(default)]
    pub description: String,
    /// First text turn sent upstream so the model opens the conversation
    #[serde(default)]
    pub greeting: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptCatalog {
    modes: BTreeMap<String, ModeProfile>,
}

impl PromptCatalog {
    pub fn builtin() -> Self {
        let mut modes = BTreeMap::new();
        modes.insert(
            "amazon_interviewer".to_string(),
            ModeProfile {
                name: "Amazon Technical Interviewer".to_string(),
                system_instruction: "You are a senior software engineer and interviewer at Amazon. \
                    You are conducting a technical interview for a software engineering position. \
                    Weave the Leadership Principles into your follow-up questions. \
                    Be professional, friendly but thorough."
                    .to_string(),
                welcome_message: "Amazon Interview Mode".to_string(),
                description: "Amazon Interview Mode: Technical + Leadership Principles".to_string(),
                greeting: Some(
                    "You are an Amazon technical interviewer. Start the interview with a brief \
                     greeting and ask your first technical question. Keep responses concise and conversational."
                        .to_string(),
                ),
            },
        );
        modes.insert(
            "google_interviewer".to_string(),
            ModeProfile {
                name: "Google Technical Interviewer".to_string(),
                system_instruction: "You are a senior software engineer and interviewer at Google. \
                    You are conducting a technical interview focused on algorithms, data structures \
                    and system design. Probe for reasoning, not just answers."
                    .to_string(),
                welcome_message: "Google Interview Mode".to_string(),
                description: "Google Interview Mode: Algorithms + System Design".to_string(),
                greeting: Some(
                    "You are a Google technical interviewer. Start the interview with a brief \
                     greeting and ask your first technical question. Keep responses concise and conversational."
                        .to_string(),
                ),
            },
        );
        modes.insert(
            "general_interviewer".to_string(),
            ModeProfile {
                name: "Technical Interviewer".to_string(),
                system_instruction: "You are a helpful technical interviewer conducting a \
                    software engineering interview. Adapt the difficulty to the candidate's answers."
                    .to_string(),
                welcome_message: "General Interview Mode".to_string(),
                description: "General Interview Mode: Technical fundamentals".to_string(),
                greeting: Some(
                    "You are a technical interviewer. Start the interview with a brief greeting \
                     and ask your first technical question. Keep responses concise and conversational."
                        .to_string(),
                ),
            },
        );
        Self { modes }
    }

    /// Load modes from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading prompts file {}", path.display()))?;
        let modes: BTreeMap<String, ModeProfile> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing prompts file {}", path.display()))?;
        if modes.is_empty() {
            anyhow::bail!("prompts file {} defines no modes", path.display());
        }
        Ok(Self { modes })
    }

    /// Load from `path` if given, falling back to the built-in catalog on any error.
    pub fn load(path: Option<&str>) -> Self {
        match path {
            Some(path) => match Self::from_file(path) {
                Ok(catalog) => {
                    info!("Loaded {} interview modes from {}", catalog.modes.len(), path);
                    catalog
                }
                Err(e) => {
                    warn!("{:#}; using built-in interview modes", e);
                    Self::builtin()
                }
            },
            None => Self::builtin(),
        }
    }

    pub fn get(&self, mode: &str) -> Option<&ModeProfile> {
        self.modes.get(mode)
    }

    pub fn contains(&self, mode: &str) -> bool {
        self.modes.contains_key(mode)
    }

    pub fn modes(&self) -> &BTreeMap<String, ModeProfile> {
        &self.modes
    }

    /// Upstream parameters for `mode`. Returns `None` for unknown modes.
    pub fn session_profile(&self, mode: &str, send_greeting: bool) -> Option<SessionProfile> {
        let profile = self.get(mode)?;
        Some(SessionProfile {
            system_instruction: format!("{}{}", profile.system_instruction, REALTIME_RULES),
            greeting: if send_greeting {
                profile.greeting.clone()
            } else {
                None
            },
        })
    }
}

impl Default for PromptCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_modes() {
        let catalog = PromptCatalog::builtin();
        for mode in ["amazon_interviewer", "google_interviewer", "general_interviewer"] {
            assert!(catalog.contains(mode), "missing {}", mode);
        }
        assert!(!catalog.contains("chef"));
    }

    #[test]
    fn test_session_profile_appends_realtime_rules() {
        let catalog = PromptCatalog::builtin();
        let profile = catalog
            .session_profile("google_interviewer", true)
            .expect("known mode");
        assert!(profile.system_instruction.starts_with("You are a senior software engineer"));
        assert!(profile.system_instruction.contains("real-time spoken conversation"));
        assert!(profile.greeting.is_some());

        let silent = catalog.session_profile("google_interviewer", false).expect("known mode");
        assert!(silent.greeting.is_none());
        assert!(catalog.session_profile("unknown", true).is_none());
    }

    #[test]
    fn test_prompts_file_and_fallback() {
        let path = std::env::temp_dir().join(format!("prompts-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"pm_interviewer": {"name": "PM", "system_instruction": "You interview PMs."}}"#,
        )
        .expect("write prompts");

        let catalog = PromptCatalog::load(path.to_str());
        assert!(catalog.contains("pm_interviewer"));
        assert!(!catalog.contains("amazon_interviewer"));
        let _ = std::fs::remove_file(&path);

        let fallback = PromptCatalog::load(Some("/definitely/not/here.json"));
        assert!(fallback.contains("amazon_interviewer"));
    }
}
