//! The assembled prompt and the builder that lays it out.

use crate::context::estimate_tokens;
use serde::Serialize;

/// Where a section sits relative to the model's attention bias.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    /// Start of the prompt.
    Primacy,
    Middle,
    /// End of the prompt, next to the query.
    Recency,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Primacy => "primacy",
            Zone::Middle => "middle",
            Zone::Recency => "recency",
        }
    }
}

/// One named block of the prompt.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PromptSection {
    /// Stable identifier, e.g. `"environment"`.
    pub name: &'static str,
    /// Markdown heading.
    pub title: String,
    pub zone: Zone,
    pub content: String,
}

impl PromptSection {
    fn render(&self) -> String {
        format!("## {}\n\n{}", self.title, self.content)
    }
}

/// Ordered prompt sections plus their estimated token count.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MetaPrompt {
    pub sections: Vec<PromptSection>,
    pub estimated_tokens: usize,
}

impl MetaPrompt {
    /// Render to one markdown string, sections separated by blank lines.
    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(PromptSection::render)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn section(&self, name: &str) -> Option<&PromptSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_names(&self) -> Vec<&'static str> {
        self.sections.iter().map(|s| s.name).collect()
    }

    pub fn zone(&self, zone: Zone) -> impl Iterator<Item = &PromptSection> {
        self.sections.iter().filter(move |s| s.zone == zone)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

/// Builder for a [`MetaPrompt`].
///
/// Sections with empty (or whitespace-only) content are skipped. `build`
/// orders sections by zone, keeping insertion order within a zone.
#[derive(Debug, Default)]
pub struct MetaPromptBuilder {
    sections: Vec<PromptSection>,
}

impl MetaPromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(
        mut self,
        zone: Zone,
        name: &'static str,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        if !content.trim().is_empty() {
            self.sections.push(PromptSection {
                name,
                title: title.into(),
                zone,
                content,
            });
        }
        self
    }

    /// Append a section only if the content is `Some`.
    pub fn section_opt(
        self,
        zone: Zone,
        name: &'static str,
        title: impl Into<String>,
        content: Option<impl Into<String>>,
    ) -> Self {
        match content {
            Some(c) => self.section(zone, name, title, c),
            None => self,
        }
    }

    pub fn build(mut self) -> MetaPrompt {
        self.sections.sort_by_key(|s| s.zone);
        let mut prompt = MetaPrompt {
            sections: self.sections,
            estimated_tokens: 0,
        };
        prompt.estimated_tokens = estimate_tokens(&prompt.render());
        prompt
    }
}
