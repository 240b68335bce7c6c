//! Card catalog and the preview builder that samples from it.
//!
//! The catalog is a JSON document loaded whole into memory:
//!
//! ```json
//! { "cards": [ { "name": "Llanowar Elves", "colors": "G",
//!                "themes": ["Tokens", "Ramp"], "curated_for": ["Ramp"],
//!                "synergy": ["Selvala"] } ] }
//! ```
//!
//! Its tag is a SHA-256 prefix of the file bytes, so any edit to the file
//! yields a new tag and therefore fresh cache keys.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::cache::entry::{CacheKey, CachePayload};
use crate::cache::service::{BoxError, PreviewBuilder};

/// Length of the hex catalog tag.
const TAG_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub name: String,

    /// Color identity as WUBRG letters; empty for colorless.
    #[serde(default)]
    pub colors: String,

    #[serde(default)]
    pub themes: Vec<String>,

    /// Themes this card is a hand-picked example for.
    #[serde(default)]
    pub curated_for: Vec<String>,

    /// Commanders this card is known to pair well with.
    #[serde(default)]
    pub synergy: Vec<String>,
}

impl Card {
    fn has_theme(&self, theme: &str) -> bool {
        self.themes.iter().any(|t| t.eq_ignore_ascii_case(theme))
    }

    fn is_curated_for(&self, theme: &str) -> bool {
        self.curated_for.iter().any(|t| t.eq_ignore_ascii_case(theme))
    }

    fn synergizes_with(&self, commander: &str) -> bool {
        self.synergy.iter().any(|c| c.eq_ignore_ascii_case(commander))
    }

    /// True if every color of the card is allowed by `filter`.
    fn within_colors(&self, filter: &str) -> bool {
        self.colors
            .chars()
            .all(|c| filter.chars().any(|f| f.eq_ignore_ascii_case(&c)))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    cards: Vec<Card>,
}

/// An immutable, tagged catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    cards: Vec<Card>,
    tag: String,
    source: Option<PathBuf>,
}

/// Catalog handle swapped wholesale on reload.
pub type SharedCatalog = Arc<RwLock<Arc<Catalog>>>;

pub fn new_shared_catalog(catalog: Catalog) -> SharedCatalog {
    Arc::new(RwLock::new(Arc::new(catalog)))
}

impl Catalog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        let mut catalog = Self::from_json(&bytes)
            .with_context(|| format!("parsing catalog {}", path.display()))?;
        catalog.source = Some(path.to_path_buf());
        info!(
            path = %path.display(),
            cards = catalog.len(),
            tag = %catalog.tag,
            "Catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_json(bytes: &[u8]) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_json::from_slice(bytes)?;
        Ok(Self {
            cards: file.cards,
            tag: content_tag(bytes),
            source: None,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Sample up to `key.limit` cards for the key's theme.
    ///
    /// Commander synergy cards come first, then curated examples, then the
    /// rest in a pseudo-random order derived from a SHA-256 of theme and
    /// card name, identical across builds and platforms.
    pub fn sample(&self, key: &CacheKey) -> ThemePreview {
        let mut matches: Vec<(u8, u64, &Card)> = self
            .cards
            .iter()
            .filter(|card| card.has_theme(&key.theme))
            .filter(|card| key.colors.as_deref().map_or(true, |f| card.within_colors(f)))
            .map(|card| {
                let rank = if key.commander.as_deref().is_some_and(|c| card.synergizes_with(c)) {
                    0
                } else if card.is_curated_for(&key.theme) {
                    1
                } else {
                    2
                };
                (rank, shuffle_order(&key.theme, &card.name), card)
            })
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let items = matches
            .into_iter()
            .take(key.limit)
            .map(|(_, _, card)| PreviewItem {
                name: card.name.clone(),
                colors: card.colors.clone(),
                curated: card.is_curated_for(&key.theme),
            })
            .collect();

        ThemePreview {
            theme: key.theme.clone(),
            items,
            catalog_tag: self.tag.clone(),
        }
    }
}

fn content_tag(bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    digest[..TAG_LEN].to_string()
}

fn shuffle_order(theme: &str, name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(theme.to_ascii_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewItem {
    pub name: String,
    pub colors: String,
    pub curated: bool,
}

/// A sampled preview for one theme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemePreview {
    pub theme: String,
    pub items: Vec<PreviewItem>,
    pub catalog_tag: String,
}

impl CachePayload for ThemePreview {
    fn curated_ratio(&self) -> Option<f64> {
        if self.items.is_empty() {
            return None;
        }
        let curated = self.items.iter().filter(|i| i.curated).count();
        Some(curated as f64 / self.items.len() as f64)
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog changed (key tag {requested}, current {current})")]
    StaleTag { requested: String, current: String },
}

/// Builds previews from whatever catalog is current.
pub struct CatalogBuilder {
    catalog: SharedCatalog,
}

impl CatalogBuilder {
    pub fn new(catalog: SharedCatalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl PreviewBuilder<ThemePreview> for CatalogBuilder {
    async fn build(&self, key: &CacheKey) -> Result<ThemePreview, BoxError> {
        let catalog = Arc::clone(&*self.catalog.read().await);
        if catalog.tag() != key.catalog_tag {
            return Err(Box::new(CatalogError::StaleTag {
                requested: key.catalog_tag.clone(),
                current: catalog.tag().to_string(),
            }));
        }
        Ok(catalog.sample(key))
    }
}
