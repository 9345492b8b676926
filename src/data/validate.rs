//! Per-row policy gate
//!
//! Checks run in a fixed order and the first failing one wins: the business
//! key must be present, the category must not be hidden and (if enabled) the
//! image must be reachable. Image probes are best effort and cached by URL.

use crate::cache::{KvStore, KvStoreExt};
use crate::data::row::{Column, FeedRow};
use rayon::prelude::*;
use rayon::ThreadPool;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RANGE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct ImportPolicy {
    hidden_categories: HashSet<String>,
    category_column: String,
    validate_images: bool,
}

impl ImportPolicy {
    pub fn new<I, S>(hidden_categories: I, category_column: &str, validate_images: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hidden_categories: hidden_categories
                .into_iter()
                .map(|c| c.as_ref().trim().to_owned())
                .filter(|c| !c.is_empty())
                .collect(),
            category_column: category_column.to_owned(),
            validate_images,
        }
    }

    /// The hidden category of `row`, if it has one
    fn hidden_category<'a>(&self, row: &'a FeedRow) -> Option<&'a str> {
        row.value_of(&self.category_column)
            .map(str::trim)
            .filter(|category| self.hidden_categories.contains(*category))
    }
}

/// Why a row is not imported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingKey,
    HiddenCategory { category: String },
    InvalidImage { url: String },
    Script(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingKey => f.write_str("missing key"),
            Rejection::HiddenCategory { .. } => f.write_str("hidden category"),
            Rejection::InvalidImage { .. } => f.write_str("invalid image"),
            Rejection::Script(reason) => write!(f, "rejected by row script: {reason}"),
        }
    }
}

/// A well-formed absolute http(s) URL, anything else is no image reference
pub fn parse_image_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    let web = matches!(url.scheme(), "http" | "https");
    (web && url.host_str().is_some_and(|h| !h.is_empty())).then_some(url)
}

pub trait ImageProbe: Send + Sync {
    /// `false` on any network error
    fn probe(&self, url: &Url) -> bool;
}

#[derive(Debug, Clone)]
pub struct HttpImageProbe {
    client: Client,
}

impl HttpImageProbe {
    pub const TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_REDIRECTS: usize = 3;
    /// Bytes requested by the fallback GET
    pub const SNIFF_BYTES: u64 = 1024;

    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Self::TIMEOUT)
            .redirect(Policy::limited(Self::MAX_REDIRECTS))
            .user_agent(concat!("wheel-feed-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn sniff(&self, url: &Url) -> bool {
        let response = match self
            .client
            .get(url.clone())
            .header(RANGE, format!("bytes=0-{}", Self::SNIFF_BYTES - 1))
            .send()
        {
            Ok(response) => response,
            Err(e) => {
                debug!(%url, error = %e, "image GET failed");
                return false;
            }
        };

        // 206 for servers honoring the range, 200 for the others
        if !response.status().is_success() {
            return false;
        }
        if is_image_content_type(response.headers()) {
            return true;
        }

        let mut head = Vec::with_capacity(Self::SNIFF_BYTES as usize);
        match response.take(Self::SNIFF_BYTES).read_to_end(&mut head) {
            Ok(_) => sniff_image(&head),
            Err(e) => {
                debug!(%url, error = %e, "could not read image bytes");
                false
            }
        }
    }
}

impl ImageProbe for HttpImageProbe {
    fn probe(&self, url: &Url) -> bool {
        match self.client.head(url.clone()).send() {
            Ok(response) => {
                let status = response.status();
                if status.is_success() && is_image_content_type(response.headers()) {
                    return true;
                }
                if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                    return false;
                }
                debug!(%url, %status, "ambiguous HEAD response, sniffing content");
            }
            Err(e) => debug!(%url, error = %e, "image HEAD failed, sniffing content"),
        }

        self.sniff(url)
    }
}

fn is_image_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().to_ascii_lowercase().starts_with("image/"))
}

/// Recognizes JPEG, PNG, GIF, WebP and SVG by their leading bytes
pub fn sniff_image(bytes: &[u8]) -> bool {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"\x89PNG\r\n\x1a\n")
        || bytes.starts_with(b"GIF87a")
        || bytes.starts_with(b"GIF89a")
    {
        return true;
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return true;
    }

    let text = String::from_utf8_lossy(bytes).to_ascii_lowercase();
    let text = text.trim_start_matches('\u{FEFF}').trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}

pub struct RowValidator {
    policy: ImportPolicy,
    probe: Arc<dyn ImageProbe>,
    store: Arc<dyn KvStore>,
    pool: ThreadPool,
}

impl fmt::Debug for RowValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowValidator")
            .field("policy", &self.policy)
            .field("probe_threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl RowValidator {
    /// How long a probe result is trusted
    pub const PROBE_TTL: Duration = Duration::from_secs(60 * 60);

    pub fn new(
        policy: ImportPolicy,
        probe: Arc<dyn ImageProbe>,
        store: Arc<dyn KvStore>,
        probe_threads: usize,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(probe_threads.max(1))
            .thread_name(|i| format!("image-probe-{i}"))
            .build()?;

        Ok(Self {
            policy,
            probe,
            store,
            pool,
        })
    }

    pub fn validate(&self, row: &FeedRow) -> Result<(), Rejection> {
        if row.business_key().is_none() {
            return Err(Rejection::MissingKey);
        }

        if let Some(category) = self.policy.hidden_category(row) {
            return Err(Rejection::HiddenCategory {
                category: category.to_owned(),
            });
        }

        if self.policy.validate_images {
            let raw = row.get(Column::ImageUrl).unwrap_or_default();
            if !self.image_is_valid(raw) {
                return Err(Rejection::InvalidImage {
                    url: raw.trim().to_owned(),
                });
            }
        }

        Ok(())
    }

    /// Probe the distinct, not yet cached image URLs of `rows` in parallel,
    /// so [`RowValidator::validate`] only hits the cache afterwards.
    ///
    /// Returns how many URLs were probed.
    pub fn warm<'a, I>(&self, rows: I) -> usize
    where
        I: IntoIterator<Item = &'a FeedRow>,
    {
        if !self.policy.validate_images {
            return 0;
        }

        let pending: BTreeSet<Url> = rows
            .into_iter()
            // rows rejected by an earlier check never need their image
            .filter(|row| row.business_key().is_some() && self.policy.hidden_category(row).is_none())
            .filter_map(|row| row.get(Column::ImageUrl).and_then(parse_image_url))
            .filter(|url| self.cached(url).is_none())
            .collect();

        if pending.is_empty() {
            return 0;
        }

        debug!(urls = pending.len(), "probing images in parallel");
        self.pool.install(|| {
            pending.par_iter().for_each(|url| {
                let valid = self.probe.probe(url);
                self.remember(url, valid);
            });
        });

        pending.len()
    }

    fn image_is_valid(&self, raw: &str) -> bool {
        let Some(url) = parse_image_url(raw) else {
            return false;
        };
        if let Some(valid) = self.cached(&url) {
            return valid;
        }

        let valid = self.probe.probe(&url);
        self.remember(&url, valid);
        valid
    }

    fn cache_key(url: &Url) -> String {
        format!("image_probe_{}", blake3::hash(url.as_str().as_bytes()).to_hex())
    }

    fn cached(&self, url: &Url) -> Option<bool> {
        match self.store.get_json::<bool>(&Self::cache_key(url)) {
            Ok(valid) => valid,
            Err(e) => {
                warn!(%url, error = %e, "could not read image probe cache");
                None
            }
        }
    }

    fn remember(&self, url: &Url, valid: bool) {
        if let Err(e) = self
            .store
            .set_json(&Self::cache_key(url), &valid, Some(Self::PROBE_TTL))
        {
            warn!(%url, error = %e, "could not cache image probe result");
        }
    }
}
