//! Builds the agent instruction string from conversation settings and the
//! active goal. Sent with every `session.update`.

use crate::goal::Goal;
use crate::settings::ConversationSettings;

/// Assembles the full instruction string: target-language enforcement,
/// proficiency guidance, the pronunciation directive, custom-subject context,
/// and active-goal guidance.
pub fn build_instructions(settings: &ConversationSettings, goal: Option<&Goal>) -> String {
    let mut sections = vec![
        format!(
            "You are a friendly conversation partner helping a learner practice {lang}. \
             Speak only in {lang}. If the learner switches to another language, answer \
             briefly and steer the conversation back to {lang}.",
            lang = settings.target_lang
        ),
        settings.proficiency.guidance().to_string(),
    ];

    if settings.pronunciation_practice {
        sections.push(
            "Listen for pronunciation mistakes. When you hear one, model the correct \
             pronunciation and ask the learner to repeat it."
                .to_string(),
        );
    }

    if !settings.custom_subjects.is_empty() {
        sections.push(format!(
            "The learner enjoys talking about: {}.",
            settings.custom_subjects.join(", ")
        ));
    }

    if let Some(goal) = goal {
        sections.push(format!(
            "The learner's current objective is \"{}\": {}. Gently create openings \
             for them to attempt it, but do not announce the objective.",
            goal.title, goal.rubric
        ));
    }

    sections.join("\n\n")
}
