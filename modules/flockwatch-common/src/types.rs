use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Pipeline stages and jobs
// ---------------------------------------------------------------------------

/// One phase of the discovery pipeline. Stage transitions happen by
/// enqueuing a new job for the next stage, never by mutating an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Search,
    PrimaryAnalyze,
    SecondaryAnalyze,
}

impl Stage {
    /// Stable string form, used as the queue routing key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Search => "search",
            Stage::PrimaryAnalyze => "primary-analyze",
            Stage::SecondaryAnalyze => "secondary-analyze",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "search" => Some(Stage::Search),
            "primary-analyze" => Some(Stage::PrimaryAnalyze),
            "secondary-analyze" => Some(Stage::SecondaryAnalyze),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued work. Immutable once created; consumed exactly once
/// per stage by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub stage: Stage,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

/// Payload for search-stage jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPayload {
    pub config_id: Uuid,
    /// Overrides the topic's default page budget when set.
    pub max_pages: Option<u32>,
}

/// Payload for both analyze stages. Carries everything the worker needs
/// so re-delivered jobs are self-contained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzePayload {
    pub config_id: Uuid,
    pub account_id: String,
    pub handle: String,
}

// ---------------------------------------------------------------------------
// Topic configuration (collaborator-owned, read-only to the pipeline)
// ---------------------------------------------------------------------------

/// A configured discovery topic: what to search for and how to prompt the
/// classifier. Prompt text is configuration, not code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub id: Uuid,
    pub name: String,
    pub keywords: Vec<String>,
    pub primary_prompt: String,
    pub secondary_prompt: String,
    /// Pages fetched per keyword when the trigger does not override it.
    pub default_max_pages: u32,
}

// ---------------------------------------------------------------------------
// Accounts and classification state
// ---------------------------------------------------------------------------

/// An account surfaced by the search stage, keyed by the platform's
/// stable external id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredAccount {
    pub account_id: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub followers: u64,
    pub discovered_at: DateTime<Utc>,
}

/// Where an account ended up. One enum spans both stage category sets:
/// the primary pass produces the first group, the secondary pass resolves
/// `Undetermined` into the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    // Primary categories
    Advocate,
    Critic,
    Neutral,
    OffTopic,
    /// Not enough signal in the topic-scoped content; routed to the
    /// secondary pass.
    Undetermined,
    // Secondary categories
    Peripheral,
    Dormant,
    Automated,
    /// Classification was unavailable (provider exhaustion, unparseable
    /// response). Low confidence, with an error marker in the reasoning.
    Uncategorized,
}

impl Category {
    /// Terminal categories are never revisited by a later stage.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Category::Undetermined | Category::Uncategorized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Advocate => "advocate",
            Category::Critic => "critic",
            Category::Neutral => "neutral",
            Category::OffTopic => "off_topic",
            Category::Undetermined => "undetermined",
            Category::Peripheral => "peripheral",
            Category::Dormant => "dormant",
            Category::Automated => "automated",
            Category::Uncategorized => "uncategorized",
        }
    }

    /// Parse a category name as returned by the model. Case-insensitive,
    /// tolerant of hyphens for the two-word variant.
    pub fn parse(s: &str) -> Option<Category> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "advocate" => Some(Category::Advocate),
            "critic" => Some(Category::Critic),
            "neutral" => Some(Category::Neutral),
            "off_topic" | "offtopic" => Some(Category::OffTopic),
            "undetermined" => Some(Category::Undetermined),
            "peripheral" => Some(Category::Peripheral),
            "dormant" => Some(Category::Dormant),
            "automated" => Some(Category::Automated),
            "uncategorized" => Some(Category::Uncategorized),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification state for one account. Written only by stage workers;
/// duplicate jobs are tolerated because workers check before writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub account_id: String,
    pub category: Category,
    pub confidence: f32,
    pub reasoning: Option<String>,
    pub classified_at: DateTime<Utc>,
    /// Durable marker that this account already went through the
    /// secondary pass; makes re-delivered secondary jobs no-ops.
    pub secondary_pass: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_string_roundtrip() {
        assert_eq!(Stage::Search.as_str(), "search");
        assert_eq!(Stage::PrimaryAnalyze.as_str(), "primary-analyze");
        assert_eq!(Stage::SecondaryAnalyze.as_str(), "secondary-analyze");
    }

    #[test]
    fn category_parse_is_case_insensitive() {
        assert_eq!(Category::parse("Advocate"), Some(Category::Advocate));
        assert_eq!(Category::parse("OFF_TOPIC"), Some(Category::OffTopic));
        assert_eq!(Category::parse("off-topic"), Some(Category::OffTopic));
        assert_eq!(Category::parse("  dormant "), Some(Category::Dormant));
        assert_eq!(Category::parse("unknown-thing"), None);
    }

    #[test]
    fn terminal_categories() {
        assert!(Category::Advocate.is_terminal());
        assert!(Category::Peripheral.is_terminal());
        assert!(!Category::Undetermined.is_terminal());
        assert!(!Category::Uncategorized.is_terminal());
    }
}
