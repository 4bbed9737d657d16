//! Conversation settings shared between the engine and its embedding layer.
//!
//! Settings are read-only inputs to instruction building. They are mutated
//! only through the engine's explicit settings-change interface and never
//! inferred from transcript content.

use serde::{Deserialize, Serialize};

/// Self-assessed proficiency of the learner in the target language.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Proficiency {
    Beginner,
    Intermediate,
    Advanced,
}

impl Proficiency {
    /// Conversation guidance matching this proficiency level, embedded into
    /// the agent instructions.
    pub fn guidance(&self) -> &'static str {
        match self {
            Proficiency::Beginner => {
                "Use short, simple sentences and common vocabulary. Speak slowly \
                 and repeat key phrases when the learner struggles."
            }
            Proficiency::Intermediate => {
                "Use everyday vocabulary with occasional idioms. Keep a natural \
                 pace but rephrase when the learner seems lost."
            }
            Proficiency::Advanced => {
                "Speak at a native pace with idiomatic, varied language. Challenge \
                 the learner with follow-up questions."
            }
        }
    }
}

/// Per-learner conversation preferences.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConversationSettings {
    /// BCP-47-ish language code the learner is practicing (e.g. "es").
    pub target_lang: String,
    /// The learner's own language, used for translations (e.g. "en").
    pub native_lang: String,
    pub proficiency: Proficiency,
    /// When enabled, the agent corrects pronunciation and the XP policy grants
    /// a small bonus on goal completion.
    pub pronunciation_practice: bool,
    /// Free-text subjects the learner wants to talk about.
    pub custom_subjects: Vec<String>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            target_lang: "es".to_string(),
            native_lang: "en".to_string(),
            proficiency: Proficiency::Beginner,
            pronunciation_practice: false,
            custom_subjects: Vec::new(),
        }
    }
}
