//! Prompt templates and rendering.
//!
//! Templates are named, versioned bodies with `{{name}}` placeholders.
//! Required variables are derived from the body itself, so a template can
//! never silently render with a hole in it. The tenant's persona is
//! injected under the reserved `persona` variable.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

/// Reserved variable carrying the tenant persona.
pub const PERSONA_VAR: &str = "persona";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template: {name}")]
    UnknownTemplate { name: String },

    #[error("template {template} is missing variable {name}")]
    MissingVariable { template: String, name: String },
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"))
}

/// A named, versioned prompt template.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub version: u32,
    body: String,
    /// Upper bound on the rendered prompt, in characters.
    pub max_length: usize,
    required: BTreeSet<String>,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, version: u32, body: impl Into<String>) -> Self {
        let body = body.into();
        let required = placeholder_re()
            .captures_iter(&body)
            .map(|c| c[1].to_string())
            .collect();
        Self {
            name: name.into(),
            version,
            body,
            max_length: 4000,
            required,
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Variables the body references, including the reserved persona.
    pub fn required_vars(&self) -> &BTreeSet<String> {
        &self.required
    }

    /// Resolve every placeholder. The persona rides in as the reserved
    /// variable; all others must be present in `vars`. Renders longer than
    /// `max_length` are truncated at a char boundary.
    pub fn render(
        &self,
        vars: &HashMap<String, String>,
        persona: &str,
    ) -> Result<RenderedPrompt, TemplateError> {
        for name in &self.required {
            if name != PERSONA_VAR && !vars.contains_key(name) {
                return Err(TemplateError::MissingVariable {
                    template: self.name.clone(),
                    name: name.clone(),
                });
            }
        }

        let mut rendered = placeholder_re()
            .replace_all(&self.body, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                if name == PERSONA_VAR {
                    persona.to_string()
                } else {
                    vars[name].clone()
                }
            })
            .into_owned();

        if rendered.chars().count() > self.max_length {
            warn!(
                template = %self.name,
                length = rendered.chars().count(),
                max_length = self.max_length,
                "rendered prompt exceeds max length, truncating"
            );
            rendered = rendered.chars().take(self.max_length).collect();
        }

        let hash = prompt_hash(&rendered);
        Ok(RenderedPrompt {
            text: rendered,
            hash,
        })
    }
}

/// A finalized prompt with its stable content hash.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub text: String,
    /// SHA-256 over the whitespace-normalized text, hex-encoded.
    pub hash: String,
}

/// Collapse whitespace runs and trim, so semantically identical prompts
/// share a hash.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable exact-match cache key for a prompt.
pub fn prompt_hash(text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Named template collection with the built-in defaults loaded.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<String, PromptTemplate>,
}

/// Name of the built-in post generation template.
pub const POST_TEMPLATE: &str = "post_generation";

impl Default for TemplateSet {
    fn default() -> Self {
        let mut set = Self {
            templates: HashMap::new(),
        };
        set.add(
            PromptTemplate::new(
                POST_TEMPLATE,
                1,
                "{{persona}}\n\n\
                 Write one short social media post about: {{topic}}\n\
                 {{context}}\n\
                 Recent posts, do not repeat them:\n{{recent}}\n\
                 Keep it under {{max_chars}} characters. Plain text, no hashtags \
                 unless they add real value. Return only the post text.",
            )
            .with_max_length(4000),
        );
        set
    }
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, replacing any previous version of the name.
    pub fn add(&mut self, template: PromptTemplate) {
        if let Some(existing) = self.templates.get(&template.name) {
            warn!(
                name = %template.name,
                old_version = existing.version,
                new_version = template.version,
                "replacing template"
            );
        }
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Result<&PromptTemplate, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate {
                name: name.to_string(),
            })
    }
}
