use std::collections::{BTreeSet, HashSet};

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{DiscoveryConfig, SiteProfile};
use crate::fetch::{Document, FetchTier, PageSource};
use crate::parser::links::{self, LinkSet};

/// A listing page waiting in the frontier.
#[derive(Debug, Clone)]
pub struct ListingNode {
    pub url: Url,
    pub depth: u8,
}

/// How a page's content was finally obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPath {
    /// Tier 1 was enough.
    Http,
    /// Tier 1 failed; the browser tier rendered the page.
    EscalatedOnFailure,
    /// Tier 1 succeeded but classified to nothing at a shallow depth, so the page was
    /// fetched a second time in the browser.
    EscalatedOnEmpty,
    /// Neither tier produced a document.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Expansion {
    pub url: String,
    pub depth: u8,
    pub path: FetchPath,
    pub products: usize,
    pub listings: usize,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Sorted, deduplicated product detail URLs.
    pub products: Vec<String>,
    /// One entry per expanded listing page, ordered by depth then URL.
    pub expansions: Vec<Expansion>,
}

impl DiscoveryReport {
    pub fn failed(&self) -> usize {
        self.expansions.iter().filter(|e| e.path == FetchPath::Failed).count()
    }

    pub fn escalated(&self) -> usize {
        self.expansions
            .iter()
            .filter(|e| matches!(e.path, FetchPath::EscalatedOnFailure | FetchPath::EscalatedOnEmpty))
            .count()
    }
}

pub struct Discovery<'a> {
    source: &'a dyn PageSource,
    site: &'a SiteProfile,
    config: &'a DiscoveryConfig,
}

impl<'a> Discovery<'a> {
    pub fn new(source: &'a dyn PageSource, site: &'a SiteProfile, config: &'a DiscoveryConfig) -> Self {
        Self { source, site, config }
    }

    /// Category pages linked from the site root.
    pub async fn root_seeds(&self, limit: Option<usize>) -> Vec<String> {
        let root = self.site.base_url.clone();
        info!("Starting discovery from {}", root);
        let (seeds, _) = self
            .fetch_escalating(
                &root,
                0,
                |doc| links::category_seeds(doc, self.site, limit),
                |seeds| seeds.is_empty(),
            )
            .await;
        info!("Found {} category seeds", seeds.len());
        seeds
    }

    /// Breadth-first, depth-bounded exploration from `seeds`. Never fails; pages that
    /// cannot be fetched contribute nothing.
    pub async fn run(&self, seeds: &[String]) -> DiscoveryReport {
        let mut visited: HashSet<String> = HashSet::new();
        let mut products: BTreeSet<String> = BTreeSet::new();
        let mut expansions = Vec::new();

        let mut frontier: Vec<ListingNode> = seeds
            .iter()
            .filter_map(|s| match Url::parse(s) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Skipping invalid seed {}: {}", s, e);
                    None
                }
            })
            .filter(|url| visited.insert(url.to_string()))
            .map(|url| ListingNode { url, depth: 0 })
            .collect();

        info!("Using {} seeds", frontier.len());

        while !frontier.is_empty() {
            let level: Vec<(Expansion, LinkSet)> = stream::iter(std::mem::take(&mut frontier))
                .map(|node| self.expand(node))
                .buffer_unordered(self.config.workers.max(1))
                .collect()
                .await;

            for (expansion, links) in level {
                debug!(
                    "{} via {:?}: {} products, {} listings",
                    expansion.url, expansion.path, expansion.products, expansion.listings
                );
                products.extend(links.products);
                if expansion.depth < self.config.max_depth {
                    for listing in links.listings {
                        if !visited.insert(listing.clone()) {
                            continue;
                        }
                        match Url::parse(&listing) {
                            Ok(url) => frontier.push(ListingNode {
                                url,
                                depth: expansion.depth + 1,
                            }),
                            Err(e) => debug!("Dropping unparsable listing {}: {}", listing, e),
                        }
                    }
                }
                expansions.push(expansion);
            }
        }

        expansions.sort_by(|a, b| (a.depth, &a.url).cmp(&(b.depth, &b.url)));
        info!(
            "Discovered {} product URLs across {} listing pages",
            products.len(),
            expansions.len()
        );

        DiscoveryReport {
            products: products.into_iter().collect(),
            expansions,
        }
    }

    async fn expand(&self, node: ListingNode) -> (Expansion, LinkSet) {
        info!("Exploring: {} (depth {})", node.url, node.depth);
        let (links, path) = self
            .fetch_escalating(
                &node.url,
                node.depth,
                |doc| links::classify(doc, self.site),
                LinkSet::is_empty,
            )
            .await;

        let expansion = Expansion {
            url: node.url.to_string(),
            depth: node.depth,
            path,
            products: links.products.len(),
            listings: links.listings.len(),
        };
        (expansion, links)
    }

    /// Tier 1 first; the browser only when tier 1 fails, or when it reads as empty on a
    /// page shallower than the escalation depth.
    async fn fetch_escalating<T: Default>(
        &self,
        url: &Url,
        depth: u8,
        read: impl Fn(&Document) -> T,
        is_empty: impl Fn(&T) -> bool,
    ) -> (T, FetchPath) {
        let escalation = match self.source.fetch(url, FetchTier::Http).await {
            Ok(doc) => {
                let found = read(&doc);
                if !is_empty(&found) || depth >= self.config.escalate_below_depth {
                    return (found, FetchPath::Http);
                }
                info!("No links found via http for {}, retrying with browser", url);
                FetchPath::EscalatedOnEmpty
            }
            Err(e) => {
                info!("Failed to fetch {} via http ({}), retrying with browser", url, e);
                FetchPath::EscalatedOnFailure
            }
        };

        match self.source.fetch(url, FetchTier::Browser).await {
            Ok(doc) => (read(&doc), escalation),
            Err(e) => {
                warn!("Browser fetch failed for {}: {}", url, e);
                let path = match escalation {
                    FetchPath::EscalatedOnEmpty => FetchPath::EscalatedOnEmpty,
                    _ => FetchPath::Failed,
                };
                (T::default(), path)
            }
        }
    }
}
