// Translation abstraction over the external machine-translation engine.
// The default implementation talks to a local ollama instance.

pub mod ollama;

use async_trait::async_trait;

use crate::error::Result;

/// Main trait for translation operations
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate one caption's text between the given languages. Idempotent
    /// per input; line breaks within the text must be preserved.
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String>;
}

/// Factory for creating translator instances
pub struct TranslatorFactory;

impl TranslatorFactory {
    /// Create the default implementation (ollama-backed)
    pub fn create_default() -> Box<dyn Translator> {
        Box::new(ollama::OllamaTranslator::new())
    }
}
