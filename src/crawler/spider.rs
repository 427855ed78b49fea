use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::crawler::request::Request;
use crate::crawler::response::{FileCell, Item, Response};
use crate::crawler::scheduler::Scheduler;
use crate::crawler::task::TaskError;

/// Identifier of a spider within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SpiderId(pub usize);

impl fmt::Display for SpiderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pause between two dequeues: `base` plus a uniform jitter in `[0, jitter)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pausetime {
    pub base: Duration,
    pub jitter: Duration,
}

impl Pausetime {
    pub fn from_millis(base_ms: u64, jitter_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            jitter: Duration::from_millis(jitter_ms),
        }
    }

    pub fn sample(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

/// Parse callback of a rule. Panics are tolerated: the crawler isolates them per request.
pub type ParseFn = Arc<dyn Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Start hook that seeds the spider's queue
pub type RootFn = Arc<dyn Fn(&mut Seeder<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Named extraction rule
#[derive(Clone)]
pub struct Rule {
    /// Column names used by [`Context::output_row`]
    pub item_fields: Vec<String>,
    parse: ParseFn,
}

impl Rule {
    pub fn new<F>(parse: F) -> Self
    where
        F: Fn(&mut Context<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            item_fields: Vec::new(),
            parse: Arc::new(parse),
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.item_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("item_fields", &self.item_fields)
            .finish_non_exhaustive()
    }
}

/// A named bundle of extraction rules and pacing configuration.
///
/// A spider holds no scheduling state; the scheduler keys its queue by [`SpiderId`].
#[derive(Clone)]
pub struct Spider {
    id: SpiderId,
    name: String,
    description: String,
    pausetime: Pausetime,
    limit: Option<usize>,
    root: Option<RootFn>,
    rules: BTreeMap<String, Rule>,
}

impl fmt::Debug for Spider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spider")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pausetime", &self.pausetime)
            .field("limit", &self.limit)
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Spider {
    pub fn builder(name: impl Into<String>) -> SpiderBuilder {
        SpiderBuilder::new(name)
    }

    pub fn id(&self) -> SpiderId {
        self.id
    }

    pub fn with_id(mut self, id: SpiderId) -> Self {
        self.id = id;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn pausetime(&self) -> Pausetime {
        self.pausetime
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Run the start hook; returns the number of seed requests accepted
    pub fn start(&self, scheduler: &Scheduler) -> anyhow::Result<usize> {
        let mut seeder = Seeder {
            spider: self,
            scheduler,
            accepted: 0,
        };
        if let Some(root) = &self.root {
            root(&mut seeder)?;
        }
        Ok(seeder.accepted)
    }
}

pub struct SpiderBuilder {
    spider: Spider,
}

impl SpiderBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            spider: Spider {
                id: SpiderId::default(),
                name: name.into(),
                description: String::new(),
                pausetime: Pausetime::default(),
                limit: None,
                root: None,
                rules: BTreeMap::new(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.spider.description = description.into();
        self
    }

    pub fn pausetime(mut self, pausetime: Pausetime) -> Self {
        self.spider.pausetime = pausetime;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.spider.limit = Some(limit);
        self
    }

    pub fn root<F>(mut self, root: F) -> Self
    where
        F: Fn(&mut Seeder<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.spider.root = Some(Arc::new(root));
        self
    }

    pub fn rule(mut self, name: impl Into<String>, rule: Rule) -> Self {
        self.spider.rules.insert(name.into(), rule);
        self
    }

    pub fn build(self) -> Spider {
        self.spider
    }
}

/// Handle given to a spider's start hook
pub struct Seeder<'a> {
    spider: &'a Spider,
    scheduler: &'a Scheduler,
    accepted: usize,
}

impl Seeder<'_> {
    pub fn spider(&self) -> &Spider {
        self.spider
    }

    pub fn add_queue(&mut self, mut request: Request) -> bool {
        request.spider = self.spider.name.clone();
        match self.scheduler.push(self.spider.id, request) {
            Ok(()) => {
                self.accepted += 1;
                true
            }
            Err(e) => {
                debug!("Seed request rejected for {}: {}", self.spider.name, e);
                false
            }
        }
    }
}

/// Parsing context for one downloaded response
pub struct Context<'a> {
    spider: &'a Spider,
    scheduler: &'a Scheduler,
    response: &'a mut Response,
    rule: Option<&'a Rule>,
}

impl<'a> Context<'a> {
    pub fn new(spider: &'a Spider, scheduler: &'a Scheduler, response: &'a mut Response) -> Self {
        Self {
            spider,
            scheduler,
            response,
            rule: None,
        }
    }

    /// Run the named rule against the response
    pub fn parse(&mut self, rule_name: &str) -> Result<(), TaskError> {
        let spider = self.spider;
        let rule = spider
            .rule(rule_name)
            .ok_or_else(|| TaskError::UnknownRule(rule_name.to_string()))?;
        self.rule = Some(rule);
        (rule.parse)(self).map_err(|e| TaskError::Parse(format!("{:#}", e)))
    }

    pub fn spider(&self) -> &Spider {
        self.spider
    }

    pub fn response(&self) -> &Response {
        self.response
    }

    pub fn url(&self) -> &str {
        self.response.url()
    }

    pub fn text(&self) -> String {
        self.response.text().into_owned()
    }

    /// Parse the body as an HTML document
    pub fn html(&self) -> scraper::Html {
        scraper::Html::parse_document(&self.response.text())
    }

    pub fn temp(&self, key: &str) -> Option<&Value> {
        self.response.request().temp(key)
    }

    /// Queue a follow-up request; referer, depth and spider are filled in from this page
    pub fn add_queue(&mut self, mut request: Request) -> bool {
        let parent = self.response.request();
        request.spider = self.spider.name.clone();
        request.depth = parent.depth + 1;
        if request.referer.is_none() {
            request.referer = Some(self.response.url().to_string());
        }
        match self.scheduler.push(self.spider.id, request) {
            Ok(()) => true,
            Err(e) => {
                debug!("Follow-up request rejected: {}", e);
                false
            }
        }
    }

    pub fn output(&mut self, item: Item) {
        self.response.push_item(item);
    }

    /// Output positional values named after the current rule's item fields
    pub fn output_row(&mut self, values: Vec<Value>) {
        let fields = self.rule.map(|rule| rule.item_fields.as_slice()).unwrap_or(&[]);
        let mut item = Item::new();
        for (index, value) in values.into_iter().enumerate() {
            let key = fields
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("field_{}", index));
            item.insert(key, value);
        }
        self.response.push_item(item);
    }

    pub fn file_output(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.response.push_file(FileCell::from_bytes(name, bytes));
    }
}

/// Catalogue of spiders available to a run, in registration order
#[derive(Debug, Default)]
pub struct SpiderRegistry {
    spiders: Vec<Spider>,
    index: HashMap<String, usize>,
}

impl SpiderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a spider, replacing one with the same name. Ids follow registration order.
    pub fn register(&mut self, spider: Spider) {
        if let Some(&position) = self.index.get(spider.name()) {
            let id = self.spiders[position].id();
            self.spiders[position] = spider.with_id(id);
            return;
        }
        let position = self.spiders.len();
        self.index.insert(spider.name().to_string(), position);
        self.spiders.push(spider.with_id(SpiderId(position)));
    }

    pub fn get(&self, name: &str) -> Option<&Spider> {
        self.index.get(name).map(|&position| &self.spiders[position])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.spiders.iter().map(Spider::name)
    }

    pub fn all(&self) -> &[Spider] {
        &self.spiders
    }

    pub fn len(&self) -> usize {
        self.spiders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spiders.is_empty()
    }

    /// Pick spiders by name; an empty selection means all of them
    pub fn select(&self, names: &[String]) -> anyhow::Result<Vec<Spider>> {
        if names.is_empty() {
            return Ok(self.spiders.clone());
        }
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Unknown spider: {}", name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spider() -> Spider {
        Spider::builder("books")
            .description("book listing")
            .pausetime(Pausetime::from_millis(10, 0))
            .root(|seeder| {
                seeder.add_queue(Request::new("https://example.com/", "list"));
                seeder.add_queue(Request::new("https://example.com/", "list"));
                Ok(())
            })
            .rule(
                "list",
                Rule::new(|ctx| {
                    ctx.output_row(vec![Value::from("title"), Value::from(3)]);
                    ctx.add_queue(Request::new("https://example.com/book/1", "detail"));
                    Ok(())
                })
                .with_fields(["name"]),
            )
            .rule("broken", Rule::new(|_| anyhow::bail!("selector missing")))
            .build()
            .with_id(SpiderId(3))
    }

    #[test]
    fn test_pausetime_sample_range() {
        let pause = Pausetime::from_millis(100, 50);
        for _ in 0..100 {
            let sample = pause.sample();
            assert!(sample >= Duration::from_millis(100));
            assert!(sample < Duration::from_millis(150));
        }
        assert_eq!(Pausetime::from_millis(7, 0).sample(), Duration::from_millis(7));
    }

    #[test]
    fn test_start_seeds_queue_once() {
        let spider = sample_spider();
        let scheduler = Scheduler::new(1);
        scheduler.register_spider(spider.id(), spider.name(), None);

        assert_eq!(spider.start(&scheduler).unwrap(), 1);
        assert_eq!(scheduler.queue_len(SpiderId(3)), 1);
    }

    #[test]
    fn test_context_parse_collects_output_and_follow_ups() {
        let spider = sample_spider();
        let scheduler = Scheduler::new(1);
        scheduler.register_spider(spider.id(), spider.name(), None);

        let mut response = Response::new(Request::new("https://example.com/", "list"));
        Context::new(&spider, &scheduler, &mut response)
            .parse("list")
            .unwrap();

        let items = response.take_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["name"], Value::from("title"));
        assert_eq!(items[0]["field_1"], Value::from(3));

        let follow = scheduler.use_one(spider.id()).unwrap().request;
        assert_eq!(follow.referer.as_deref(), Some("https://example.com/"));
        assert_eq!(follow.depth, 1);
        assert_eq!(follow.spider, "books");
    }

    #[test]
    fn test_context_parse_errors() {
        let spider = sample_spider();
        let scheduler = Scheduler::new(1);
        let mut response = Response::new(Request::new("https://example.com/", "list"));
        let mut ctx = Context::new(&spider, &scheduler, &mut response);

        assert!(matches!(ctx.parse("missing"), Err(TaskError::UnknownRule(_))));
        match ctx.parse("broken") {
            Err(TaskError::Parse(message)) => assert!(message.contains("selector missing")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_registry_assigns_ids_and_selects() {
        let mut registry = SpiderRegistry::new();
        registry.register(Spider::builder("a").build());
        registry.register(Spider::builder("b").build());
        registry.register(Spider::builder("a").description("replaced").build());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a").unwrap().id(), SpiderId(0));
        assert_eq!(registry.get("a").unwrap().description(), "replaced");
        assert_eq!(registry.get("b").unwrap().id(), SpiderId(1));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);

        assert_eq!(registry.select(&[]).unwrap().len(), 2);
        assert_eq!(registry.select(&["b".to_string()]).unwrap()[0].name(), "b");
        assert!(registry.select(&["c".to_string()]).is_err());
    }
}
