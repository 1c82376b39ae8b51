//! # Prompt template loading and structure
//!
//! The wording used to frame a query for the generation backend.
//!
//! A template is a small YAML document that specifies:
//! - a `context_instruction` placed in front of retrieved context, telling the model
//!   to answer only from that context, to admit when it lacks the information, and
//!   not to bring the context up unless asked,
//! - a `transcript_label` introducing the recent conversation so the model reads it
//!   as reference material rather than a format to continue,
//! - a `user_prompt_label` delimiting the raw user prompt, which always comes last.
//!
//! Templates live under the configuration directory:
//!
//! ```text
//! <config_dir>/templates/<name>.yaml
//! ```
//!
//! When no template is configured, [`PromptTemplate::default`] is used.
//!
//! ## Minimal YAML example
//!
//! ```yaml
//! context_instruction: "Answer strictly from this context:"
//! transcript_label: "Earlier conversation (reference only):"
//! user_prompt_label: "USER PROMPT:"
//! ```

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::Path};

/// Wording used by [`crate::brain::Brain`] to compose prompts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PromptTemplate {
    /// Instruction placed before retrieved context.
    pub context_instruction: String,

    /// Heading placed before the conversation transcript.
    pub transcript_label: String,

    /// Heading placed before the raw user prompt.
    pub user_prompt_label: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            context_instruction: "You are a helpful chatbot. Use only the following pieces of \
context to answer the question. Do not hallucinate nor make up new information. You are free \
to reply that you do not have enough context if you do not know the answer to something, not \
knowing is not a mistake. Only mention the context you have if DIRECTLY asked for it:"
                .to_string(),
            transcript_label: "CONVERSATION HISTORY (most recent last; this is a record of \
earlier turns for reference only, do not imitate its format or prefix your answer with a role \
label):"
                .to_string(),
            user_prompt_label: "USER PROMPT:".to_string(),
        }
    }
}

/// Load a prompt template by name from the user's config directory.
///
/// Resolves `<config_dir>/templates/<name>.yaml`.
///
/// ### Errors
/// Returns an error if the config directory cannot be determined, the file cannot
/// be read, or its YAML does not describe a [`PromptTemplate`].
pub async fn load_template(name: &str) -> Result<PromptTemplate, Box<dyn Error>> {
    let path = crate::config_dir()?.join(format!("templates/{name}.yaml"));
    load_template_from(&path)
}

/// Load a prompt template from an explicit path.
pub fn load_template_from(path: &Path) -> Result<PromptTemplate, Box<dyn Error>> {
    tracing::info!("Loading template: {}", path.display());

    let content = fs::read_to_string(path)?;
    let template: PromptTemplate = serde_yaml::from_str(&content)?;
    Ok(template)
}
