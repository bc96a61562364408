use serde::{Deserialize, Serialize};
use std::fmt;

/// What the caller asked to generate, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
}

impl PromptDescriptor {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            style: None,
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn key(&self) -> GenerationKey {
        GenerationKey::new(&self.prompt, self.style.as_deref())
    }
}

/// Normalized identity of a deduplicable unit of work.
///
/// The prompt is trimmed with internal whitespace runs collapsed to a single
/// space; the style is trimmed and lower-cased, and an empty style is the
/// same as no style. Two descriptors with equal keys share one generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GenerationKey {
    prompt: String,
    style: Option<String>,
}

impl GenerationKey {
    pub fn new(prompt: &str, style: Option<&str>) -> Self {
        let prompt = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
        let style = style
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        Self { prompt, style }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn style(&self) -> Option<&str> {
        self.style.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.prompt.is_empty()
    }

    /// The normalized descriptor handed to the generator.
    pub fn descriptor(&self) -> PromptDescriptor {
        PromptDescriptor {
            prompt: self.prompt.clone(),
            style: self.style.clone(),
        }
    }
}

impl fmt::Display for GenerationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.style {
            Some(style) => write!(f, "{} [{}]", self.prompt, style),
            None => f.write_str(&self.prompt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalizes_whitespace() {
        let a = PromptDescriptor::new("  a   cat\n on a mat ").key();
        let b = PromptDescriptor::new("a cat on a mat").key();
        assert_eq!(a, b);
        assert_eq!(a.prompt(), "a cat on a mat");
    }

    #[test]
    fn test_key_normalizes_style() {
        let a = PromptDescriptor::new("cat").with_style(" Watercolor ").key();
        let b = PromptDescriptor::new("cat").with_style("watercolor").key();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "cat [watercolor]");
    }

    #[test]
    fn test_empty_style_is_no_style() {
        let a = PromptDescriptor::new("cat").with_style("  ").key();
        assert_eq!(a, PromptDescriptor::new("cat").key());
        assert!(a.style().is_none());
    }

    #[test]
    fn test_style_distinguishes_keys() {
        let a = PromptDescriptor::new("cat").with_style("sketch").key();
        let b = PromptDescriptor::new("cat").key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_blank_prompt_is_empty() {
        assert!(PromptDescriptor::new(" \t ").key().is_empty());
    }
}
