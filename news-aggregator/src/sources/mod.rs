pub mod news_api;
pub mod site;
pub mod site_analyzer;

use std::sync::Arc;

use interfaces::{SourceAdapter, SourceKind};

pub use news_api::NewsApiAdapter;
pub use site::SiteAdapter;
pub use site_analyzer::{SiteAnalyzer, SiteSuggestion};

/// The closed set of adapters, one per source kind.
#[derive(Clone)]
pub struct SourceAdapters {
    api: Arc<dyn SourceAdapter>,
    site: Arc<dyn SourceAdapter>,
    mailbox: Arc<dyn SourceAdapter>,
}

impl SourceAdapters {
    pub fn new(
        api: Arc<dyn SourceAdapter>,
        site: Arc<dyn SourceAdapter>,
        mailbox: Arc<dyn SourceAdapter>,
    ) -> Self {
        Self { api, site, mailbox }
    }

    pub fn for_kind(&self, kind: SourceKind) -> &Arc<dyn SourceAdapter> {
        match kind {
            SourceKind::Api => &self.api,
            SourceKind::Site => &self.site,
            SourceKind::Mailbox => &self.mailbox,
        }
    }
}
