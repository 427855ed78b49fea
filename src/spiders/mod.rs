pub mod filter;

use anyhow::{Context as _, Result};
use regex::Regex;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use url::Url;

use crate::cli::config::PauseSettings;
use crate::crawler::request::Request;
use crate::crawler::response::Item;
use crate::crawler::spider::{Context, Pausetime, Rule, Spider, SpiderRegistry};
use crate::storage::storage_name;

pub use filter::{UrlFilter, UrlPatterns};

/// Spider defined entirely in configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SelectorSpiderConfig {
    pub name: String,
    pub description: String,
    /// Overrides `crawler.default_pause`
    pub pause: Option<PauseSettings>,
    pub limit: Option<usize>,
    pub start_urls: Vec<String>,
    pub start_rule: String,
    pub allowed_domains: Vec<String>,
    pub url_patterns: UrlPatterns,
    pub rules: BTreeMap<String, SelectorRule>,
}

/// Extraction rule: item fields plus the links to follow
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SelectorRule {
    /// Item field name to CSS selector; the text of the first match is used
    pub fields: BTreeMap<String, String>,
    pub follow: Vec<FollowLink>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FollowLink {
    pub selector: String,
    #[serde(default = "default_attribute")]
    pub attribute: String,
    /// Rule applied to the followed page
    pub rule: String,
    /// Only follow links matching this regex
    #[serde(default)]
    pub allow: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

fn default_attribute() -> String {
    "href".to_string()
}

struct CompiledFollow {
    selector: Selector,
    attribute: String,
    rule: String,
    allow: Option<Regex>,
    priority: i32,
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow::anyhow!("Invalid CSS selector '{}': {:?}", selector, e))
}

fn first_text(element: Option<ElementRef<'_>>) -> Value {
    match element {
        Some(element) => {
            let text = element.text().collect::<Vec<_>>().join(" ");
            Value::from(text.split_whitespace().collect::<Vec<_>>().join(" "))
        }
        None => Value::Null,
    }
}

fn compile_rule(config: &SelectorRule, filter: Arc<UrlFilter>) -> Result<Rule> {
    let fields = config
        .fields
        .iter()
        .map(|(name, selector)| -> Result<(String, Selector)> {
            Ok((name.clone(), parse_selector(selector)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let follows = config
        .follow
        .iter()
        .map(|follow| -> Result<CompiledFollow> {
            let allow = follow
                .allow
                .as_deref()
                .map(Regex::new)
                .transpose()
                .context(format!("Invalid allow pattern for rule {}", follow.rule))?;
            Ok(CompiledFollow {
                selector: parse_selector(&follow.selector)?,
                attribute: follow.attribute.clone(),
                rule: follow.rule.clone(),
                allow,
                priority: follow.priority,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let field_names: Vec<String> = fields.iter().map(|(name, _)| name.clone()).collect();

    Ok(Rule::new(move |ctx: &mut Context<'_>| {
        let html = ctx.html();

        if !fields.is_empty() {
            let mut item = Item::new();
            for (name, selector) in &fields {
                item.insert(name.clone(), first_text(html.select(selector).next()));
            }
            ctx.output(item);
        }

        if follows.is_empty() {
            return Ok(());
        }

        let base = Url::parse(ctx.url()).context(format!("Invalid page URL: {}", ctx.url()))?;
        let mut links = Vec::new();
        for follow in &follows {
            for element in html.select(&follow.selector) {
                let Some(target) = element.value().attr(&follow.attribute) else {
                    continue;
                };
                let Ok(mut link) = base.join(target.trim()) else {
                    continue;
                };
                link.set_fragment(None);
                let allowed = follow.allow.as_ref().map_or(true, |allow| allow.is_match(link.as_str()));
                if allowed && filter.allows(&link) {
                    links.push(Request::new(link.as_str(), follow.rule.as_str()).with_priority(follow.priority));
                }
            }
        }
        for request in links {
            ctx.add_queue(request);
        }
        Ok(())
    })
    .with_fields(field_names))
}

impl SelectorSpiderConfig {
    /// Compile the configuration into a runnable spider
    pub fn build(&self, default_pause: Pausetime) -> Result<Spider> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Spider definition without a name");
        }
        if !self.rules.contains_key(&self.start_rule) {
            anyhow::bail!(
                "Spider {}: start rule '{}' is not defined",
                self.name,
                self.start_rule
            );
        }
        for (name, rule) in &self.rules {
            for follow in &rule.follow {
                if !self.rules.contains_key(&follow.rule) {
                    anyhow::bail!(
                        "Spider {}: rule '{}' follows unknown rule '{}'",
                        self.name,
                        name,
                        follow.rule
                    );
                }
            }
        }
        for start_url in &self.start_urls {
            Url::parse(start_url)
                .context(format!("Spider {}: invalid start URL {}", self.name, start_url))?;
        }

        let filter = Arc::new(UrlFilter::new(&self.url_patterns, &self.allowed_domains));
        let pausetime = self.pause.map(Pausetime::from).unwrap_or(default_pause);
        let start_urls = self.start_urls.clone();
        let start_rule = self.start_rule.clone();

        let mut builder = Spider::builder(self.name.clone())
            .description(self.description.clone())
            .pausetime(pausetime)
            .root(move |seeder| {
                for url in &start_urls {
                    seeder.add_queue(Request::new(url.as_str(), start_rule.as_str()));
                }
                Ok(())
            });
        if let Some(limit) = self.limit {
            builder = builder.limit(limit);
        }

        for (name, rule) in &self.rules {
            let compiled = compile_rule(rule, Arc::clone(&filter))
                .context(format!("Spider {}: rule '{}'", self.name, name))?;
            builder = builder.rule(name.clone(), compiled);
        }

        Ok(builder.build())
    }
}

/// Build a registry from every configured spider
pub fn registry_from_config(configs: &[SelectorSpiderConfig], default_pause: Pausetime) -> Result<SpiderRegistry> {
    let mut registry = SpiderRegistry::new();
    let mut outputs: HashMap<String, &str> = HashMap::new();
    for config in configs {
        let output = storage_name(&config.name);
        if let Some(other) = outputs.insert(output.clone(), &config.name) {
            // Redefining the same spider replaces it; only distinct names collide
            if other != config.name {
                anyhow::bail!(
                    "Spiders '{}' and '{}' would write to the same output '{}'",
                    other,
                    config.name,
                    output
                );
            }
        }
        registry.register(config.build(default_pause)?);
    }
    Ok(registry)
}
