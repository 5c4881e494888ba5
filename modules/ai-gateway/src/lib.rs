pub mod anthropic;
pub mod openai;
pub mod openrouter;
pub mod router;
pub mod traits;
pub mod util;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;
pub use router::{ProviderRouter, RouterConfig};
pub use traits::{AiProvider, Completions, Message, MessageRole};
