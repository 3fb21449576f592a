//! The page-source capability the crawler drives, and its HTTP implementation.
//!
//! A page source owns one "rendered" listing at a time: navigation replaces
//! it, clicking a pagination control may grow it.

mod http;

use std::path::PathBuf;
use std::time::Duration;

use pricewatch_shared::Result;

pub use http::{ElementHandle, HttpPageSource};

/// Rendering/automation operations consumed by [`crate::CatalogCrawler`].
#[allow(async_fn_in_trait)]
pub trait PageSource {
    /// Opaque reference to a rendered element (listed item or control).
    type Handle: Clone + std::fmt::Debug;

    /// Load `url`, discarding whatever was rendered before.
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// All rendered elements matching `selector`, in document order.
    async fn find_all(&mut self, selector: &str) -> Result<Vec<Self::Handle>>;

    /// Visible text of an element, one line per text block.
    async fn element_text(&mut self, handle: &Self::Handle) -> Result<String>;

    /// Absolute URL of the element's link.
    async fn element_link_href(&mut self, handle: &Self::Handle) -> Result<String>;

    /// A control whose visible text contains `label_text`, if one is rendered.
    async fn find_control(&mut self, label_text: &str) -> Result<Option<Self::Handle>>;

    /// Trigger a control.
    async fn click(&mut self, handle: &Self::Handle) -> Result<()>;

    /// Wait until `predicate` holds for the number of elements matching
    /// `selector`. Returns `false` when `timeout` elapses first.
    async fn wait_until(
        &mut self,
        selector: &str,
        predicate: &(dyn Fn(usize) -> bool + Send + Sync),
        timeout: Duration,
    ) -> Result<bool>;

    /// Dump the current rendering for diagnosis. Returns where it was written.
    async fn snapshot(&mut self, label: &str) -> Result<Option<PathBuf>>;
}
