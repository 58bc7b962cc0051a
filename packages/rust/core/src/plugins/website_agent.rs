//! Website agent: an autonomous same-origin crawler driven by three model roles.
//!
//! 1. The seed page is visited and an **extractor** fills a relaxed copy of the
//!    target schema from that page alone.
//! 2. While budget remains and unvisited links are known, a **navigator** picks
//!    the next batch of URLs from the candidate links (or says it is done).
//!    The batch is visited concurrently and each page is extracted.
//! 3. A **merger** consolidates the partial extractions into one object that
//!    satisfies the strict schema. A single page is returned unmerged.
//!
//! Only successful extractions consume budget. Every attempted URL is marked
//! visited, so a failing page is never retried.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};
use url::Url;

use rowforge_crawler::{Page, normalize_str, same_origin};
use rowforge_shared::{
    ContentPart, Message, ModelConfig, PluginKind, PluginPacket, PluginSpec, Result, Row,
    RowForgeError,
};

use super::{ContentProvider, ExecutionContext, ResolvedConfig, mismatched};
use crate::artifacts::ArtifactEvent;
use crate::model::BoundModel;
use crate::querier::Querier;
use crate::{schema, template, truncate_chars};

/// Unvisited links offered to the navigator per round.
const MAX_CANDIDATES: usize = 50;

/// Page text handed to the extractor.
const MAX_PAGE_CHARS: usize = 30_000;

/// Website-agent settings after rendering against a row.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub url: String,
    pub schema: Value,
    pub instructions: Option<String>,
    pub budget: usize,
    pub batch_size: usize,
    /// Falls back to the owning step's retry cap.
    pub max_retries: Option<u32>,
    pub extractor: ModelConfig,
    pub navigator: ModelConfig,
    pub merger: ModelConfig,
}

pub struct WebsiteAgentProvider;

#[async_trait]
impl ContentProvider for WebsiteAgentProvider {
    fn kind(&self) -> PluginKind {
        PluginKind::WebsiteAgent
    }

    fn resolve_config(
        &self,
        raw: &PluginSpec,
        row: &Row,
        inherited: &ModelConfig,
    ) -> Result<ResolvedConfig> {
        let PluginSpec::WebsiteAgent(spec) = raw else {
            return Err(mismatched(self.kind(), raw.kind()));
        };
        if !spec.schema.is_object() {
            return Err(RowForgeError::config("website-agent schema must be a JSON object"));
        }

        Ok(ResolvedConfig::WebsiteAgent(AgentConfig {
            url: template::render(&spec.url, row).trim().to_string(),
            schema: spec.schema.clone(),
            instructions: spec.instructions.as_deref().map(|i| template::render(i, row)),
            budget: spec.budget,
            batch_size: spec.batch_size.max(1),
            max_retries: spec.max_retries,
            extractor: spec.extractor.over(inherited),
            navigator: spec.navigator.over(inherited),
            merger: spec.merger.over(inherited),
        }))
    }

    async fn execute(
        &self,
        config: ResolvedConfig,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Vec<PluginPacket>> {
        let ResolvedConfig::WebsiteAgent(config) = config else {
            return Err(mismatched(self.kind(), config.kind()));
        };

        let crawl = Crawl::new(&config, ctx)?;
        let (findings, state) = crawl.run().await?;

        let log = json!({
            "seed": config.url,
            "visited": state.visited_order,
            "extractions": state
                .extractions
                .iter()
                .map(|(url, data)| json!({ "url": url, "data": data }))
                .collect::<Vec<_>>(),
            "result": findings,
        });
        let stem = format!("{}_crawl", ctx.instance_id);
        if let Err(e) = ctx
            .sink
            .emit(ArtifactEvent::json(ctx.row_id, ctx.step_index, &stem, &log))
            .await
        {
            warn!(error = %e, "failed to write crawl log");
        }

        let pretty = serde_json::to_string_pretty(&findings).unwrap_or_else(|_| findings.to_string());
        Ok(vec![PluginPacket::new(
            Some(findings),
            vec![ContentPart::text(format!(
                "Findings from {}:\n\n{pretty}",
                config.url
            ))],
        )])
    }
}

// ---------------------------------------------------------------------------
// Crawl state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct KnownLink {
    href: String,
    text: String,
    found_on: String,
}

#[derive(Debug, Default)]
struct CrawlState {
    visited: HashSet<String>,
    visited_order: Vec<String>,
    links: Vec<KnownLink>,
    known: HashSet<String>,
    extractions: Vec<(String, Value)>,
    budget: usize,
}

impl CrawlState {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    fn mark_visited(&mut self, url: &str) {
        let key = normalize_str(url);
        if self.visited.insert(key.clone()) {
            self.visited_order.push(key);
        }
    }

    /// Record same-origin links from `page`; earlier provenance is never overwritten.
    fn add_links(&mut self, page: &Page, seed: &Url) {
        for link in &page.links {
            let Ok(parsed) = Url::parse(&link.href) else {
                continue;
            };
            if !same_origin(seed, &parsed) {
                continue;
            }
            let key = normalize_str(&link.href);
            if self.known.insert(key.clone()) {
                self.links.push(KnownLink {
                    href: key,
                    text: link.text.clone(),
                    found_on: page.url.clone(),
                });
            }
        }
    }

    fn candidates(&self) -> Vec<&KnownLink> {
        self.links
            .iter()
            .filter(|l| !self.visited.contains(&l.href))
            .take(MAX_CANDIDATES)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Navigation {
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    done: bool,
}

// ---------------------------------------------------------------------------
// Crawl
// ---------------------------------------------------------------------------

struct Crawl<'a> {
    config: &'a AgentConfig,
    ctx: &'a ExecutionContext<'a>,
    seed: Url,
    relaxed: Value,
    max_retries: u32,
    extractor: BoundModel,
    navigator: BoundModel,
    merger: BoundModel,
}

impl<'a> Crawl<'a> {
    fn new(config: &'a AgentConfig, ctx: &'a ExecutionContext<'a>) -> Result<Self> {
        let seed = Url::parse(&config.url).map_err(|e| {
            RowForgeError::plugin(ctx.instance_id, format!("invalid seed URL `{}`: {e}", config.url))
        })?;

        Ok(Self {
            config,
            ctx,
            seed,
            relaxed: schema::relax(&config.schema),
            max_retries: config.max_retries.unwrap_or(ctx.max_retries),
            extractor: ctx.models.bind(&config.extractor),
            navigator: ctx.models.bind(&config.navigator),
            merger: ctx.models.bind(&config.merger),
        })
    }

    #[instrument(skip_all, fields(seed = %self.seed, budget = self.config.budget))]
    async fn run(&self) -> Result<(Value, CrawlState)> {
        let mut state = CrawlState::new(self.config.budget);

        if state.budget > 0 {
            self.visit_batch(&mut state, vec![self.seed.to_string()]).await?;
        }

        while state.budget > 0 {
            let candidates = state.candidates();
            if candidates.is_empty() {
                debug!("no unvisited links left");
                break;
            }

            let navigation = match self.navigate(&state, &candidates).await {
                Ok(navigation) => navigation,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "navigator failed, keeping results so far");
                    break;
                }
            };
            if navigation.done {
                debug!("navigator reported done");
                break;
            }

            let allowed: HashSet<&str> = candidates.iter().map(|l| l.href.as_str()).collect();
            let mut batch: Vec<String> = Vec::new();
            for url in &navigation.urls {
                let key = normalize_str(url.trim());
                if !allowed.contains(key.as_str()) {
                    warn!(url = %url, "navigator chose a URL outside the candidate set, ignoring");
                    continue;
                }
                if !batch.contains(&key) {
                    batch.push(key);
                }
            }
            batch.truncate(self.config.batch_size.min(state.budget));
            if batch.is_empty() {
                debug!("navigator returned no usable URLs");
                break;
            }

            self.visit_batch(&mut state, batch).await?;
        }

        info!(
            pages = state.extractions.len(),
            visited = state.visited.len(),
            "crawl finished"
        );
        let findings = self.merge(&state).await?;
        Ok((findings, state))
    }

    /// Visit and extract every URL concurrently; failures are isolated.
    async fn visit_batch(&self, state: &mut CrawlState, batch: Vec<String>) -> Result<()> {
        let results = join_all(batch.iter().map(|url| self.visit_and_extract(url))).await;

        for (url, result) in batch.iter().zip(results) {
            state.mark_visited(url);
            match result {
                Ok((page, data)) => {
                    state.mark_visited(&page.url);
                    state.add_links(&page, &self.seed);
                    state.extractions.push((page.url, data));
                    state.budget = state.budget.saturating_sub(1);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(%url, error = %e, "page dropped from crawl"),
            }
        }
        Ok(())
    }

    async fn visit_and_extract(&self, url: &str) -> Result<(Page, Value)> {
        let page = self.ctx.pages.visit(url).await?;

        let mut system = self.role_preamble(
            "You extract structured data from a single web page. Fill only the fields \
             this page supports and use null for everything else. Never guess.",
        );
        system.push(ContentPart::text(format!(
            "Page: {}{}",
            page.url,
            page.title
                .as_deref()
                .map(|t| format!(" ({t})"))
                .unwrap_or_default()
        )));
        let conversation = [Message::user_text(truncate_chars(&page.text, MAX_PAGE_CHARS))];

        let outcome = Querier::new(&self.extractor, self.max_retries)
            .with_schema("page_extraction", &self.relaxed)
            .lenient()
            .run(&system, &conversation)
            .await
            .map_err(|e| RowForgeError::CrawlPage {
                url: page.url.clone(),
                message: format!("extraction failed: {e}"),
            })?;

        debug!(url = %page.url, attempts = outcome.attempts, "page extracted");
        Ok((page, outcome.value))
    }

    async fn navigate(&self, state: &CrawlState, candidates: &[&KnownLink]) -> Result<Navigation> {
        let schema = json!({
            "type": "object",
            "properties": {
                "urls": {"type": "array", "items": {"type": "string"}},
                "done": {"type": "boolean"}
            },
            "required": ["urls", "done"]
        });

        let system = self.role_preamble(&format!(
            "You steer a website crawl. Pick at most {} URLs from the candidate list that \
             are most likely to hold the missing information. Set `done` to true when the \
             findings are complete or no candidate looks useful.",
            self.config.batch_size.min(state.budget)
        ));

        let findings = state
            .extractions
            .iter()
            .map(|(url, data)| format!("- {url}: {data}"))
            .collect::<Vec<_>>()
            .join("\n");
        let links = candidates
            .iter()
            .map(|l| format!("- {} \"{}\" (found on {})", l.href, l.text, l.found_on))
            .collect::<Vec<_>>()
            .join("\n");
        let conversation = [Message::user_text(format!(
            "Findings so far:\n{}\n\nCandidate links:\n{links}",
            if findings.is_empty() { "(none)" } else { findings.as_str() }
        ))];

        let outcome = Querier::new(&self.navigator, self.max_retries)
            .with_schema("navigation", &schema)
            .run(&system, &conversation)
            .await?;

        serde_json::from_value(outcome.value)
            .map_err(|e| RowForgeError::parse(format!("unreadable navigator decision: {e}")))
    }

    async fn merge(&self, state: &CrawlState) -> Result<Value> {
        match state.extractions.as_slice() {
            [] => return Ok(Value::Object(Map::new())),
            [(_, only)] => return Ok(only.clone()),
            _ => {}
        }

        let system = self.role_preamble(
            "You merge partial extractions gathered from several pages of one website \
             into a single object. Prefer specific values over empty ones and resolve \
             conflicts in favor of the most authoritative page.",
        );
        let partials = state
            .extractions
            .iter()
            .map(|(url, data)| format!("Source: {url}\n{data}"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let conversation = [Message::user_text(partials)];

        let outcome = Querier::new(&self.merger, self.max_retries)
            .with_schema("merge", &self.config.schema)
            .run(&system, &conversation)
            .await?;
        Ok(outcome.value)
    }

    fn role_preamble(&self, role: &str) -> Vec<ContentPart> {
        let mut parts = vec![ContentPart::text(role)];
        if let Some(instructions) = &self.config.instructions {
            parts.push(ContentPart::text(format!("Goal: {instructions}")));
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rowforge_shared::RowId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::model::{ModelRequest, ModelResponse};
    use crate::testing::{self, MemorySink, ScriptedModel};

    fn page(title: &str, links: &[&str]) -> String {
        let anchors = links
            .iter()
            .map(|l| format!(r#"<a href="{l}">{l}</a>"#))
            .collect::<String>();
        format!(
            "<html><head><title>{title}</title></head>\
             <body><main><h1>{title}</h1><p>About {title}.</p>{anchors}</main></body></html>"
        )
    }

    async fn serve(server: &MockServer, route: &str, body: String) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html"))
            .mount(server)
            .await;
    }

    fn schema_name(request: &ModelRequest) -> &str {
        request
            .response_format
            .as_ref()
            .map(|f| f.name.as_str())
            .unwrap_or("")
    }

    fn config(seed: String, budget: usize, batch_size: usize) -> AgentConfig {
        let model = ModelConfig {
            model: "test/model".into(),
            temperature: None,
            reasoning_effort: None,
            generate_images: false,
            aspect_ratio: None,
        };
        AgentConfig {
            url: seed,
            schema: json!({
                "type": "object",
                "properties": {"found": {"type": "string"}},
                "required": ["found"]
            }),
            instructions: Some("Find the founder".into()),
            budget,
            batch_size,
            max_retries: Some(1),
            extractor: model.clone(),
            navigator: model.clone(),
            merger: model,
        }
    }

    async fn run(
        provider: Arc<ScriptedModel>,
        sink: Arc<MemorySink>,
        config: AgentConfig,
    ) -> Result<Vec<PluginPacket>> {
        let services = testing::services(provider, sink)?;
        let row = Row::new();
        let row_id = RowId::new(0);
        let ctx = ExecutionContext {
            row: &row,
            row_id: &row_id,
            step_index: 0,
            instance_id: "agent",
            max_retries: 3,
            models: &services.models,
            pages: &services.pages,
            dedupe: &services.dedupe,
            sink: services.sink.as_ref(),
        };
        WebsiteAgentProvider
            .execute(ResolvedConfig::WebsiteAgent(config), &ctx)
            .await
    }

    #[tokio::test]
    async fn budget_caps_total_pages_visited() {
        let server = MockServer::start().await;
        let base = server.uri();
        serve(&server, "/", page("Home", &["/a", "/b", "/c", "/d", "/e"])).await;
        for route in ["/a", "/b", "/c", "/d", "/e"] {
            serve(&server, route, page(route, &[])).await;
        }

        let every_link: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|p| format!("{base}/{p}"))
            .collect();
        let provider = Arc::new(ScriptedModel::new().with_responder(move |request| {
            let text = match schema_name(request) {
                "navigation" => json!({"urls": every_link, "done": false}).to_string(),
                "merge" => r#"{"found": "merged"}"#.to_string(),
                _ => r#"{"found": "partial"}"#.to_string(),
            };
            Ok(ModelResponse::text(text))
        }));
        let sink = Arc::new(MemorySink::new());

        let packets = run(provider.clone(), sink.clone(), config(format!("{base}/"), 3, 5))
            .await
            .unwrap();

        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, Some(json!({"found": "merged"})));
        assert!(packets[0].content_parts[0].as_text().unwrap().contains("merged"));
        assert!(sink.paths().contains(&"0/agent_crawl.json".to_string()));

        let names: Vec<String> = provider
            .requests()
            .iter()
            .map(|r| schema_name(r).to_string())
            .collect();
        assert_eq!(names.iter().filter(|n| *n == "page_extraction").count(), 3);
        assert_eq!(names.iter().filter(|n| *n == "merge").count(), 1);

        let extraction = provider
            .requests()
            .into_iter()
            .find(|r| schema_name(r) == "page_extraction")
            .unwrap();
        let format = extraction.response_format.unwrap();
        assert!(!format.strict);
        assert!(format.schema.get("required").is_none());
    }

    #[tokio::test]
    async fn urls_outside_candidates_are_rejected() {
        let server = MockServer::start().await;
        let base = server.uri();
        serve(&server, "/", page("Home", &["/a"])).await;
        serve(&server, "/a", page("A", &[])).await;

        let provider = Arc::new(ScriptedModel::new().with_responder(|request| {
            let text = match schema_name(request) {
                "navigation" => r#"{"urls": ["https://elsewhere.example/secret"], "done": false}"#,
                _ => r#"{"found": "home"}"#,
            };
            Ok(ModelResponse::text(text))
        }));

        let packets = run(provider.clone(), Arc::new(MemorySink::new()), config(format!("{base}/"), 5, 2))
            .await
            .unwrap();

        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        // A single page is returned without a merge call.
        assert_eq!(packets[0].data, Some(json!({"found": "home"})));
        assert!(provider.requests().iter().all(|r| schema_name(r) != "merge"));
    }

    #[tokio::test]
    async fn navigator_failure_keeps_partial_results() {
        let server = MockServer::start().await;
        let base = server.uri();
        serve(&server, "/", page("Home", &["/a"])).await;

        let provider = Arc::new(ScriptedModel::new().with_responder(|request| {
            match schema_name(request) {
                "navigation" => Err(RowForgeError::Provider("HTTP 500".into())),
                _ => Ok(ModelResponse::text(r#"{"found": "seed"}"#)),
            }
        }));

        let packets = run(provider, Arc::new(MemorySink::new()), config(format!("{base}/"), 5, 2))
            .await
            .unwrap();

        assert_eq!(packets[0].data, Some(json!({"found": "seed"})));
    }

    #[tokio::test]
    async fn failed_pages_do_not_consume_budget() {
        let server = MockServer::start().await;
        let base = server.uri();
        serve(&server, "/", page("Home", &["/missing", "/a"])).await;
        serve(&server, "/a", page("A", &[])).await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let nav_base = base.clone();
        let provider = Arc::new(ScriptedModel::new().with_responder(move |request| {
            let text = match schema_name(request) {
                "navigation" => json!({
                    "urls": [format!("{nav_base}/missing"), format!("{nav_base}/a")],
                    "done": false
                })
                .to_string(),
                "merge" => r#"{"found": "merged"}"#.to_string(),
                _ => r#"{"found": "page"}"#.to_string(),
            };
            Ok(ModelResponse::text(text))
        }));

        let packets = run(provider, Arc::new(MemorySink::new()), config(format!("{base}/"), 2, 2))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let hits = |p: &str| requests.iter().filter(|r| r.url.path() == p).count();
        assert_eq!(hits("/missing"), 1);
        assert_eq!(hits("/a"), 1);
        assert_eq!(packets[0].data, Some(json!({"found": "merged"})));
    }

    #[tokio::test]
    async fn zero_successful_pages_yield_empty_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = Arc::new(ScriptedModel::new());
        let packets = run(
            provider.clone(),
            Arc::new(MemorySink::new()),
            config(format!("{}/", server.uri()), 3, 2),
        )
        .await
        .unwrap();

        assert_eq!(packets[0].data, Some(json!({})));
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn first_link_provenance_wins() {
        let seed = Url::parse("https://acme.com/").unwrap();
        let link = |href: &str| rowforge_crawler::PageLink {
            href: href.into(),
            text: "x".into(),
        };
        let first = Page {
            url: "https://acme.com/".into(),
            title: None,
            text: String::new(),
            links: vec![link("https://acme.com/team"), link("https://other.com/")],
        };
        let second = Page {
            url: "https://acme.com/about".into(),
            title: None,
            text: String::new(),
            links: vec![link("https://acme.com/team")],
        };

        let mut state = CrawlState::new(3);
        state.add_links(&first, &seed);
        state.add_links(&second, &seed);

        assert_eq!(state.links.len(), 1);
        assert_eq!(state.links[0].found_on, "https://acme.com/");
        state.mark_visited("https://acme.com/team");
        assert!(state.candidates().is_empty());
    }
}
