//! [`PageSource`] over plain HTTP for server-rendered listings.
//!
//! Each navigation or pagination click fetches one HTML document. The rendered
//! listing is the concatenation of every document loaded since the last
//! navigation, so "load more" links behave like an infinite-scroll button.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use scraper::{ElementRef, Html, Node, Selector};
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use url::Url;

use pricewatch_shared::{CrawlConfig, PriceWatchError, Result};

use super::PageSource;

/// Element registered by one listing read. Handles from an earlier read are
/// stale once `find_all` or `navigate` runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    generation: u64,
    index: usize,
}

#[derive(Debug, Clone)]
struct LoadedPage {
    url: Url,
    body: String,
}

#[derive(Debug, Clone)]
struct RenderedElement {
    text: String,
    href: Option<Url>,
}

/// HTTP-backed page source using `reqwest` for fetching and `scraper` for
/// element lookup.
pub struct HttpPageSource {
    client: Client,
    pages: Vec<LoadedPage>,
    elements: Vec<RenderedElement>,
    generation: u64,
    /// Match counts per selector for the current set of loaded documents.
    counts: HashMap<String, usize>,
    link_selector: Selector,
    control_selector: Selector,
    poll_interval: Duration,
    snapshot_dir: Option<PathBuf>,
}

impl HttpPageSource {
    /// Build a page source from the runtime crawl configuration.
    pub fn new(config: &CrawlConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PriceWatchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            pages: Vec::new(),
            elements: Vec::new(),
            generation: 0,
            counts: HashMap::new(),
            link_selector: parse_selector("a[href]")?,
            control_selector: parse_selector("a, button")?,
            poll_interval: config.poll_interval,
            snapshot_dir: config.snapshot_dir.clone(),
        })
    }

    async fn fetch(&self, url: &Url) -> Result<String> {
        debug!(%url, "fetching listing document");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| PriceWatchError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PriceWatchError::Network(format!("{url}: HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| PriceWatchError::Network(format!("{url}: body read failed: {e}")))
    }

    fn register(&mut self, element: RenderedElement) -> ElementHandle {
        self.elements.push(element);
        ElementHandle {
            generation: self.generation,
            index: self.elements.len() - 1,
        }
    }

    /// Drop every registered element and invalidate outstanding handles.
    fn reset_elements(&mut self) {
        self.generation += 1;
        self.elements.clear();
    }

    fn element(&self, handle: &ElementHandle) -> Result<&RenderedElement> {
        if handle.generation != self.generation {
            return Err(PriceWatchError::source(format!(
                "stale element handle {} from an earlier listing read",
                handle.index
            )));
        }
        self.elements
            .get(handle.index)
            .ok_or_else(|| PriceWatchError::source(format!("unknown element handle {}", handle.index)))
    }

    /// Elements matching `selector` across every loaded document.
    fn rendered(&self, selector: &str) -> Result<Vec<RenderedElement>> {
        let selector = parse_selector(selector)?;
        let mut found = Vec::new();
        for page in &self.pages {
            let doc = Html::parse_document(&page.body);
            for el in doc.select(&selector) {
                found.push(RenderedElement {
                    text: visible_text(&el),
                    href: first_link(&el, &self.link_selector, &page.url),
                });
            }
        }
        Ok(found)
    }

    /// Loaded documents only change on navigate or click, so a count is
    /// computed once per selector until then.
    fn count(&mut self, selector: &str) -> Result<usize> {
        if let Some(&count) = self.counts.get(selector) {
            return Ok(count);
        }
        let count = self.rendered(selector)?.len();
        self.counts.insert(selector.to_string(), count);
        Ok(count)
    }

    /// A labelled control in the most recently loaded document.
    fn control(&self, label_text: &str) -> Option<RenderedElement> {
        let page = self.pages.last()?;
        let doc = Html::parse_document(&page.body);
        doc.select(&self.control_selector)
            .find(|el| el.text().collect::<String>().contains(label_text))
            .map(|el| {
                let target = el
                    .value()
                    .attr("href")
                    .or_else(|| el.value().attr("data-href"))
                    .and_then(|href| resolve_href(href, &page.url));
                RenderedElement {
                    text: visible_text(&el),
                    href: target,
                }
            })
    }
}

impl PageSource for HttpPageSource {
    type Handle = ElementHandle;

    #[instrument(skip(self))]
    async fn navigate(&mut self, url: &str) -> Result<()> {
        let url = Url::parse(url)
            .map_err(|e| PriceWatchError::validation(format!("invalid listing url '{url}': {e}")))?;
        let body = self.fetch(&url).await?;
        self.pages = vec![LoadedPage { url, body }];
        self.counts.clear();
        self.reset_elements();
        Ok(())
    }

    async fn find_all(&mut self, selector: &str) -> Result<Vec<ElementHandle>> {
        let found = self.rendered(selector)?;
        self.counts.insert(selector.to_string(), found.len());
        self.reset_elements();
        Ok(found.into_iter().map(|el| self.register(el)).collect())
    }

    async fn element_text(&mut self, handle: &ElementHandle) -> Result<String> {
        Ok(self.element(handle)?.text.clone())
    }

    async fn element_link_href(&mut self, handle: &ElementHandle) -> Result<String> {
        self.element(handle)?
            .href
            .as_ref()
            .map(Url::to_string)
            .ok_or_else(|| PriceWatchError::source("element has no link"))
    }

    async fn find_control(&mut self, label_text: &str) -> Result<Option<ElementHandle>> {
        Ok(self.control(label_text).map(|el| self.register(el)))
    }

    async fn click(&mut self, handle: &ElementHandle) -> Result<()> {
        let target = self
            .element(handle)?
            .href
            .clone()
            .ok_or_else(|| PriceWatchError::source("control is not actionable"))?;

        if self.pages.iter().any(|page| page.url == target) {
            debug!(%target, "control points at an already loaded document");
            return Ok(());
        }

        let body = self.fetch(&target).await?;
        self.pages.push(LoadedPage { url: target, body });
        self.counts.clear();
        Ok(())
    }

    async fn wait_until(
        &mut self,
        selector: &str,
        predicate: &(dyn Fn(usize) -> bool + Send + Sync),
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(self.count(selector)?) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn snapshot(&mut self, label: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.snapshot_dir else {
            debug!(label, "no snapshot directory configured");
            return Ok(None);
        };

        std::fs::create_dir_all(dir).map_err(|e| PriceWatchError::io(dir, e))?;
        let path = dir.join(format!("debug_{}.html", slug(label)));

        let mut content = String::new();
        for page in &self.pages {
            content.push_str(&format!("<!-- {} -->\n", page.url));
            content.push_str(&page.body);
            content.push('\n');
        }
        std::fs::write(&path, content).map_err(|e| PriceWatchError::io(&path, e))?;

        info!(path = %path.display(), "snapshot saved");
        Ok(Some(path))
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| PriceWatchError::parse(format!("invalid selector '{selector}': {e:?}")))
}

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "dd", "div", "dl", "dt", "figcaption",
    "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li",
    "main", "nav", "ol", "p", "pre", "section", "table", "td", "th", "tr", "ul",
];

const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Rendered text of an item element, one line per field.
///
/// Each child element of the item and every block element below it starts a
/// new line; inline markup (`<b>`, `<small>`, nested `<span>`) stays on the
/// line it appears in. Whitespace inside a line is collapsed.
fn visible_text(el: &ElementRef<'_>) -> String {
    let mut text = TextLines::default();
    for child in el.children() {
        match child.value() {
            Node::Text(t) => text.push(t),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    text.break_line();
                    collect_text(&child, &mut text);
                    text.break_line();
                }
            }
            _ => {}
        }
    }
    text.finish()
}

fn collect_text(el: &ElementRef<'_>, text: &mut TextLines) {
    let name = el.value().name();
    if HIDDEN_TAGS.contains(&name) {
        return;
    }
    if name == "br" {
        text.break_line();
        return;
    }

    let block = BLOCK_TAGS.contains(&name);
    if block {
        text.break_line();
    }
    for child in el.children() {
        match child.value() {
            Node::Text(t) => text.push(t),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(&child, text);
                }
            }
            _ => {}
        }
    }
    if block {
        text.break_line();
    }
}

#[derive(Default)]
struct TextLines {
    lines: Vec<String>,
    current: String,
}

impl TextLines {
    fn push(&mut self, fragment: &str) {
        self.current.push_str(fragment);
    }

    fn break_line(&mut self) {
        let line = self.current.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            self.lines.push(line);
        }
        self.current.clear();
    }

    fn finish(mut self) -> String {
        self.break_line();
        self.lines.join("\n")
    }
}

/// The element's own href if it is a link, else its first descendant link.
fn first_link(el: &ElementRef<'_>, link_selector: &Selector, base: &Url) -> Option<Url> {
    if el.value().name() == "a" {
        if let Some(url) = el.value().attr("href").and_then(|h| resolve_href(h, base)) {
            return Some(url);
        }
    }
    el.select(link_selector)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| resolve_href(href, base))
}

/// Resolve a link against the page URL, dropping anchors and script links.
fn resolve_href(href: &str, base: &Url) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    resolved.set_fragment(None);
    Some(resolved)
}

fn slug(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> CrawlConfig {
        CrawlConfig {
            poll_interval: Duration::from_millis(5),
            ..CrawlConfig::default()
        }
    }

    const FIRST_PAGE: &str = r#"<html><body><ul>
        <li data-productid="1"><a href="/p/spirit">Spirit 42mm</a><span>98.500,00 TL</span></li>
        <li data-productid="2"><a href="/p/hydroconquest#reviews">HydroConquest</a><span>75.250,00 TL</span></li>
    </ul><a class="more" href="/list?page=2">Daha Fazla Göster</a></body></html>"#;

    const SECOND_PAGE: &str = r#"<html><body><ul>
        <li data-productid="2"><a href="/p/hydroconquest">HydroConquest</a><span>75.250,00 TL</span></li>
        <li data-productid="3"><a href="/p/conquest">Conquest</a><span>61.000,00 TL</span></li>
    </ul></body></html>"#;

    async fn listing_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SECOND_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FIRST_PAGE))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_resolve_href() {
        let base = Url::parse("https://shop.example.com/list").unwrap();
        assert_eq!(
            resolve_href("/p/a#x", &base).unwrap().as_str(),
            "https://shop.example.com/p/a"
        );
        assert!(resolve_href("#top", &base).is_none());
        assert!(resolve_href("javascript:void(0)", &base).is_none());
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Frederique Constant"), "Frederique-Constant");
    }

    #[tokio::test]
    async fn reads_items_text_and_links() {
        let server = listing_server().await;
        let mut source = HttpPageSource::new(&test_config()).unwrap();
        source
            .navigate(&format!("{}/list", server.uri()))
            .await
            .unwrap();

        let items = source.find_all("li[data-productid]").await.unwrap();
        assert_eq!(items.len(), 2);

        let text = source.element_text(&items[0]).await.unwrap();
        assert_eq!(text, "Spirit 42mm\n98.500,00 TL");

        let href = source.element_link_href(&items[1]).await.unwrap();
        assert_eq!(href, format!("{}/p/hydroconquest", server.uri()));
    }

    #[tokio::test]
    async fn load_more_appends_next_document() {
        let server = listing_server().await;
        let mut source = HttpPageSource::new(&test_config()).unwrap();
        source
            .navigate(&format!("{}/list", server.uri()))
            .await
            .unwrap();

        let control = source.find_control("Daha Fazla").await.unwrap();
        let control = control.expect("load more control");
        source.click(&control).await.unwrap();

        let grew = source
            .wait_until("li[data-productid]", &|n| n > 2, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(grew);
        assert_eq!(source.find_all("li[data-productid]").await.unwrap().len(), 4);

        // The second document has no control of its own
        assert!(source.find_control("Daha Fazla").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wait_times_out_without_growth() {
        let server = listing_server().await;
        let mut source = HttpPageSource::new(&test_config()).unwrap();
        source
            .navigate(&format!("{}/list", server.uri()))
            .await
            .unwrap();

        let grew = source
            .wait_until("li[data-productid]", &|n| n > 2, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!grew);
    }

    #[tokio::test]
    async fn navigate_fails_on_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut source = HttpPageSource::new(&test_config()).unwrap();
        let err = source
            .navigate(&format!("{}/list", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn snapshot_writes_loaded_html() {
        let server = listing_server().await;
        let dir = std::env::temp_dir().join(format!("pw-snapshot-{}", uuid::Uuid::now_v7()));
        let config = CrawlConfig {
            snapshot_dir: Some(dir.clone()),
            ..test_config()
        };
        let mut source = HttpPageSource::new(&config).unwrap();
        source
            .navigate(&format!("{}/list", server.uri()))
            .await
            .unwrap();

        let path = source.snapshot("Frederique Constant").await.unwrap().unwrap();
        assert!(path.ends_with("debug_Frederique-Constant.html"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Spirit 42mm"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    const INLINE_MARKUP: &str = r#"<html><body><ul>
        <li data-productid="1">
            <a href="/p/spirit">Spirit <b>42mm</b>
                Automatic</a><span class="price">98.500,00 <small>TL</small></span>
        </li>
        <li data-productid="2"><div class="card">
            <h3>Conquest<br>Heritage</h3>
            <p><em>61.000,00</em>&nbsp;TL<script>track()</script></p>
        </div></li>
    </ul></body></html>"#;

    async fn inline_markup_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INLINE_MARKUP))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn inline_markup_stays_on_one_line() {
        let server = inline_markup_server().await;
        let mut source = HttpPageSource::new(&test_config()).unwrap();
        source
            .navigate(&format!("{}/list", server.uri()))
            .await
            .unwrap();

        let items = source.find_all("li[data-productid]").await.unwrap();
        assert_eq!(
            source.element_text(&items[0]).await.unwrap(),
            "Spirit 42mm Automatic\n98.500,00 TL"
        );
        assert_eq!(
            source.element_text(&items[1]).await.unwrap(),
            "Conquest\nHeritage\n61.000,00 TL"
        );
    }

    #[tokio::test]
    async fn crawler_parses_prices_split_by_inline_markup() {
        use crate::engine::CatalogCrawler;
        use crate::price::PriceParser;
        use pricewatch_shared::Target;

        let server = inline_markup_server().await;
        let config = CrawlConfig {
            settle_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
            ..test_config()
        };
        let mut source = HttpPageSource::new(&config).unwrap();
        let crawler = CatalogCrawler::new(config);
        let target = Target {
            label: "Longines".into(),
            url: format!("{}/list", server.uri()),
        };

        let mut session = crawler.crawl(&mut source, &target);
        let first = session.next_record().await.unwrap().unwrap();
        assert_eq!(first.display_name, "Spirit 42mm Automatic");
        assert_eq!(first.raw_price_text, "98.500,00 TL");
        assert_eq!(PriceParser::default().parse(&first.raw_price_text), 98_500.0);

        let second = session.next_record().await.unwrap().unwrap();
        assert_eq!(second.display_name, "Conquest");
        assert_eq!(PriceParser::default().parse(&second.raw_price_text), 61_000.0);
    }

    #[tokio::test]
    async fn handles_from_an_earlier_read_are_stale() {
        let server = listing_server().await;
        let mut source = HttpPageSource::new(&test_config()).unwrap();
        source
            .navigate(&format!("{}/list", server.uri()))
            .await
            .unwrap();

        let first = source.find_all("li[data-productid]").await.unwrap();
        let second = source.find_all("li[data-productid]").await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(source.elements.len(), 2);

        let err = source.element_text(&first[0]).await.unwrap_err();
        assert!(err.to_string().contains("stale"));
        assert!(source.element_text(&second[0]).await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_without_directory_is_noop() {
        let mut source = HttpPageSource::new(&test_config()).unwrap();
        assert!(source.snapshot("Longines").await.unwrap().is_none());
    }
}
