use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::council::Tier;
use crate::error::{Error, Result};

const LEVEL1: &str = include_str!("templates/level1.md");
const LEVEL2: &str = include_str!("templates/level2.md");
const LEVEL3: &str = include_str!("templates/level3.md");
const CONSOLIDATION: &str = include_str!("templates/consolidation.md");
const ORCHESTRATION: &str = include_str!("templates/orchestration.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptType {
    Level1,
    Level2,
    Level3,
    Consolidation,
    Orchestration,
}

impl PromptType {
    pub fn for_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(PromptType::Level1),
            2 => Some(PromptType::Level2),
            3 => Some(PromptType::Level3),
            _ => None,
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            PromptType::Level1 => LEVEL1,
            PromptType::Level2 => LEVEL2,
            PromptType::Level3 => LEVEL3,
            PromptType::Consolidation => CONSOLIDATION,
            PromptType::Orchestration => ORCHESTRATION,
        }
    }
}

impl fmt::Display for PromptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromptType::Level1 => "level1",
            PromptType::Level2 => "level2",
            PromptType::Level3 => "level3",
            PromptType::Consolidation => "consolidation",
            PromptType::Orchestration => "orchestration",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionMode {
    Locked,
    Required,
    Optional,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    pub mode: SectionMode,
    /// Tier restriction; empty means the section applies to every tier.
    pub tiers: Vec<Tier>,
    pub body: String,
}

impl Section {
    fn applies_to(&self, tier: Tier) -> bool {
        self.tiers.is_empty() || self.tiers.contains(&tier)
    }
}

/// A prompt template: tagged sections in declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub sections: Vec<Section>,
}

impl Template {
    /// Parse `<section name="…" [locked|required|optional] [tier="a,b"]>…</section>`
    /// blocks. Text outside section tags is ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let open_re = Regex::new(r#"<section\s+([^>]*)>"#).expect("static regex");
        let name_re = Regex::new(r#"name="([^"]+)""#).expect("static regex");
        let tier_re = Regex::new(r#"tier="([^"]+)""#).expect("static regex");

        let mut sections = Vec::new();
        let mut rest = text;
        while let Some(open) = open_re.captures(rest) {
            let tag = open.get(0).expect("whole match");
            let attrs = &open[1];
            let after_tag = &rest[tag.end()..];
            let close = after_tag.find("</section>").ok_or_else(|| {
                Error::Prompt(format!("unclosed <section> tag near: {}", &tag.as_str()))
            })?;

            let name = name_re
                .captures(attrs)
                .map(|c| c[1].to_string())
                .ok_or_else(|| Error::Prompt("section without a name attribute".into()))?;

            let has = |flag: &str| {
                attrs
                    .split_whitespace()
                    .any(|token| token == flag)
            };
            let mode = match (has("locked"), has("required"), has("optional")) {
                (true, false, false) => SectionMode::Locked,
                (false, true, false) => SectionMode::Required,
                (false, false, _) => SectionMode::Optional,
                _ => {
                    return Err(Error::Prompt(format!(
                        "section '{name}' mixes locked/required/optional flags"
                    )));
                }
            };

            let tiers = match tier_re.captures(attrs) {
                Some(caps) => caps[1]
                    .split(',')
                    .map(|t| match t.trim() {
                        "fast" => Ok(Tier::Fast),
                        "balanced" => Ok(Tier::Balanced),
                        "thorough" => Ok(Tier::Thorough),
                        other => Err(Error::Prompt(format!(
                            "section '{name}' has unknown tier: {other}"
                        ))),
                    })
                    .collect::<Result<Vec<Tier>>>()?,
                None => vec![],
            };

            sections.push(Section {
                name,
                mode,
                tiers,
                body: after_tag[..close].trim().to_string(),
            });
            rest = &after_tag[close + "</section>".len()..];
        }

        if sections.is_empty() {
            return Err(Error::Prompt("template has no sections".into()));
        }
        Ok(Template { sections })
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Check a variant against this base template: `locked` sections must be
    /// byte-identical, `required` sections must be present (rephrasing is
    /// allowed), `optional` sections may be missing.
    pub fn validate_variant(&self, variant: &Template) -> Result<()> {
        for base in &self.sections {
            match base.mode {
                SectionMode::Locked => match variant.section(&base.name) {
                    Some(section) if section.body == base.body => {}
                    Some(_) => {
                        return Err(Error::Prompt(format!(
                            "locked section '{}' was modified",
                            base.name
                        )));
                    }
                    None => {
                        return Err(Error::Prompt(format!(
                            "locked section '{}' is missing",
                            base.name
                        )));
                    }
                },
                SectionMode::Required => {
                    if variant.section(&base.name).is_none() {
                        return Err(Error::Prompt(format!(
                            "required section '{}' is missing",
                            base.name
                        )));
                    }
                }
                SectionMode::Optional => {}
            }
        }
        Ok(())
    }

    /// Render: tier-filter, collapse empty sections, substitute placeholders,
    /// concatenate bodies in declared order with tags stripped.
    pub fn build(&self, tier: Tier, vars: &HashMap<String, String>) -> Result<String> {
        let mut parts = Vec::new();
        for section in &self.sections {
            if !section.applies_to(tier) || section.body.is_empty() {
                continue;
            }
            let rendered = render(&section.body, vars)
                .map_err(|e| Error::Prompt(format!("section '{}': {e}", section.name)))?;
            if !rendered.trim().is_empty() {
                parts.push(rendered.trim().to_string());
            }
        }
        Ok(parts.join("\n\n"))
    }
}

/// Substitute `{{name}}` placeholders using the `upon` engine.
fn render(body: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(body)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}

/// Holds the parsed default templates plus any validated variants.
pub struct PromptBuilder {
    templates: HashMap<PromptType, Template>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut templates = HashMap::new();
        for kind in [
            PromptType::Level1,
            PromptType::Level2,
            PromptType::Level3,
            PromptType::Consolidation,
            PromptType::Orchestration,
        ] {
            templates.insert(kind, Template::parse(kind.default_template())?);
        }
        Ok(Self { templates })
    }

    /// Replace a template with a variant after validating it against the
    /// shipped default.
    pub fn set_variant(&mut self, kind: PromptType, text: &str) -> Result<()> {
        let variant = Template::parse(text)?;
        let base = Template::parse(kind.default_template())?;
        base.validate_variant(&variant)?;
        self.templates.insert(kind, variant);
        Ok(())
    }

    pub fn template(&self, kind: PromptType) -> &Template {
        &self.templates[&kind]
    }

    pub fn build(
        &self,
        kind: PromptType,
        tier: Tier,
        vars: &HashMap<String, String>,
    ) -> Result<String> {
        self.template(kind).build(tier, vars)
    }
}
