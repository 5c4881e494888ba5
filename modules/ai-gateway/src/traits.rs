use anyhow::Result;
use async_trait::async_trait;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// =============================================================================
// Completions Trait
// =============================================================================

/// Anything that can turn a message list into generated text. The
/// failover router is the production implementation; callers depend on
/// this seam so tests can script responses.
#[async_trait]
pub trait Completions: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String>;
}

// =============================================================================
// AiProvider Trait
// =============================================================================

/// One upstream AI service. Implementations are stateless HTTP clients;
/// all rotation and rate-limit bookkeeping lives in the router.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Models this provider exposes, in priority order. The router rotates
    /// through these before moving to the next provider.
    fn models(&self) -> &[String];

    /// Whether the provider is locally usable (credentials configured).
    fn is_available(&self) -> bool;

    /// Run one completion against the given model and return the generated
    /// text. Errors must include the upstream status text so the router can
    /// recognize rate-limit responses.
    async fn complete(&self, model: &str, messages: &[Message]) -> Result<String>;
}
