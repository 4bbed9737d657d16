//! Parla Core Library
//!
//! Provider-independent domain logic for the parla conversation practice
//! engine: conversation settings, agent instruction building, the tolerant
//! responses-endpoint client, translation with phrase alignment, and the
//! goal/XP model with its evaluation and seeding contracts.

pub mod goal;
pub mod instructions;
pub mod responses;
pub mod settings;
pub mod translate;
