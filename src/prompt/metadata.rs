use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static FRONT_MATTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|\z)(.*)\z")
        .expect("front matter pattern")
});

/// A variable a prompt documents in its front matter.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PromptVariable {
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PromptMetadata {
    pub name: String,
    pub description: String,
    pub author: String,
    pub version: String,
    pub category: String,
    pub tags: Vec<String>,
    pub variables: Vec<PromptVariable>,
    pub extends: String,
    pub path: String,
}

/// Splits `content` into its front matter and body.
///
/// Content without a leading `---` block is returned whole with `None`.
pub fn extract_metadata(content: &str) -> (Option<PromptMetadata>, &str) {
    let Some(captures) = FRONT_MATTER.captures(content) else {
        return (None, content);
    };
    let header = captures.get(1).map_or("", |m| m.as_str());
    let body = captures.get(2).map_or("", |m| m.as_str());
    (Some(parse_front_matter(header)), body)
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

fn parse_tags(value: &str) -> Vec<String> {
    let value = value.trim();
    let value = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value);
    value
        .split(',')
        .map(unquote)
        .filter(|tag| !tag.is_empty())
        .collect()
}

enum Section {
    Root,
    Tags,
    Variables,
}

fn parse_front_matter(header: &str) -> PromptMetadata {
    let mut metadata = PromptMetadata::default();
    let mut section = Section::Root;

    for line in header.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        let trimmed = line.trim();

        if indented || trimmed.starts_with("- ") {
            match section {
                Section::Tags => {
                    if let Some(tag) = trimmed.strip_prefix("- ") {
                        let tag = unquote(tag);
                        if !tag.is_empty() {
                            metadata.tags.push(tag);
                        }
                    }
                }
                Section::Variables => {
                    let (starts_item, entry) = match trimmed.strip_prefix("- ") {
                        Some(rest) => (true, rest),
                        None => (false, trimmed),
                    };
                    if starts_item {
                        metadata.variables.push(PromptVariable::default());
                    }
                    if let Some((key, value)) = entry.split_once(':')
                        && let Some(variable) = metadata.variables.last_mut()
                    {
                        match key.trim() {
                            "name" => variable.name = unquote(value),
                            "description" => variable.description = unquote(value),
                            _ => {}
                        }
                    }
                }
                Section::Root => {}
            }
            continue;
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        section = Section::Root;
        match key.trim() {
            "name" => metadata.name = unquote(value),
            "description" => metadata.description = unquote(value),
            "author" => metadata.author = unquote(value),
            "version" => metadata.version = unquote(value),
            "category" => metadata.category = unquote(value),
            "extends" => metadata.extends = unquote(value),
            "tags" => {
                if value.trim().is_empty() {
                    section = Section::Tags;
                } else {
                    metadata.tags = parse_tags(value);
                }
            }
            "variables" => section = Section::Variables,
            _ => {}
        }
    }

    metadata.variables.retain(|variable| !variable.name.is_empty());
    metadata
}
