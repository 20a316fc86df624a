use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kensa_core::error::TemplateError;
use kensa_core::message::Message;

use crate::dataset::EvaluationCase;

const INPUT_VARS: [&str; 2] = ["question", "input"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

/// Split a `{name}` template into literal and variable segments.
/// `{{` and `}}` are escapes for literal braces.
fn parse(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut var_name = String::new();
                let mut found_close = false;
                for next_ch in chars.by_ref() {
                    if next_ch == '}' {
                        found_close = true;
                        break;
                    }
                    var_name.push(next_ch);
                }
                if !found_close {
                    return Err(TemplateError::Unclosed);
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Var(var_name.trim().to_string()));
            }
            _ => literal.push(ch),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn render(segments: &[Segment], vars: &BTreeMap<&str, &str>) -> Result<String, TemplateError> {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Var(name) => {
                let value = vars
                    .get(name.as_str())
                    .ok_or_else(|| TemplateError::MissingVariable(name.clone()))?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

/// The fixed system prompt plus a user-message template for one model under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TemplateSource", into = "TemplateSource")]
pub struct InstructionTemplate {
    system_prompt: String,
    user_template: String,
    system_segments: Vec<Segment>,
    user_segments: Vec<Segment>,
}

#[derive(Serialize, Deserialize)]
struct TemplateSource {
    system_prompt: String,
    #[serde(default = "default_user_template")]
    user_template: String,
}

fn default_user_template() -> String {
    "{question}".into()
}

impl TryFrom<TemplateSource> for InstructionTemplate {
    type Error = TemplateError;

    fn try_from(src: TemplateSource) -> Result<Self, Self::Error> {
        Self::new(src.system_prompt, src.user_template)
    }
}

impl From<InstructionTemplate> for TemplateSource {
    fn from(t: InstructionTemplate) -> Self {
        Self {
            system_prompt: t.system_prompt,
            user_template: t.user_template,
        }
    }
}

impl InstructionTemplate {
    pub fn new(
        system_prompt: impl Into<String>,
        user_template: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        let system_prompt = system_prompt.into();
        let user_template = user_template.into();
        let system_segments = parse(&system_prompt)?;
        let user_segments = parse(&user_template)?;
        let references_input = user_segments
            .iter()
            .any(|s| matches!(s, Segment::Var(v) if INPUT_VARS.contains(&v.as_str())));
        if !references_input {
            return Err(TemplateError::NoInputPlaceholder);
        }
        Ok(Self {
            system_prompt,
            user_template,
            system_segments,
            user_segments,
        })
    }

    /// A system prompt with the case input passed through as the user message.
    pub fn with_system_prompt(system_prompt: impl Into<String>) -> Result<Self, TemplateError> {
        Self::new(system_prompt, default_user_template())
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn user_template(&self) -> &str {
        &self.user_template
    }

    /// Names of every placeholder, in order of first appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in self.system_segments.iter().chain(&self.user_segments) {
            if let Segment::Var(v) = segment {
                if !names.contains(&v.as_str()) {
                    names.push(v);
                }
            }
        }
        names
    }

    /// Placeholders that are neither the input nor one of `columns`.
    pub fn unresolved<'a>(&'a self, has_column: impl Fn(&str) -> bool) -> Vec<&'a str> {
        self.variables()
            .into_iter()
            .filter(|v| !INPUT_VARS.contains(v) && !has_column(v))
            .collect()
    }

    /// Render `[system, user]` messages for a case.
    pub fn render(&self, case: &EvaluationCase) -> Result<Vec<Message>, TemplateError> {
        let mut vars: BTreeMap<&str, &str> = case
            .context
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for name in INPUT_VARS {
            vars.insert(name, case.input.as_str());
        }
        Ok(vec![
            Message::system(render(&self.system_segments, &vars)?),
            Message::user(render(&self.user_segments, &vars)?),
        ])
    }
}
