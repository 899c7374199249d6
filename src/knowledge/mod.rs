//! External knowledge lookups for the memory stage.
//!
//! Sources are tried in order and their answers concatenated. A failing
//! source never fails the lookup; the answer is flagged `degraded` and the
//! error text is carried along for the model.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::KnowledgeConfig;
use crate::error::NarratorError;
use crate::provider::http::shared_client;
use crate::util::text::truncate_utf8;

/// A place knowledge can be looked up.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    fn name(&self) -> &str;

    /// Text about `query`, or `None` when the source knows nothing.
    async fn lookup(&self, query: &str) -> Result<Option<String>, NarratorError>;
}

/// Combined answer returned to the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeAnswer {
    pub query: String,
    pub summary: String,
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Paragraph search over a local UTF-8 file, re-read on every lookup.
pub struct FileKnowledge {
    path: PathBuf,
    max_chars: usize,
}

impl FileKnowledge {
    pub fn new(path: impl Into<PathBuf>, max_chars: usize) -> Self {
        Self {
            path: path.into(),
            max_chars,
        }
    }
}

#[async_trait]
impl KnowledgeSource for FileKnowledge {
    fn name(&self) -> &str {
        "file"
    }

    async fn lookup(&self, query: &str) -> Result<Option<String>, NarratorError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            let message = format!("{}: {e}", self.path.display());
            NarratorError::tool("lookup_external_knowledge", message)
        })?;

        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(None);
        }

        let hits: Vec<&str> = text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| {
                let lower = p.to_lowercase();
                !p.is_empty() && terms.iter().any(|t| lower.contains(t.as_str()))
            })
            .collect();
        if hits.is_empty() {
            return Ok(None);
        }
        Ok(Some(truncate_chars(&hits.join("\n\n"), self.max_chars)))
    }
}

/// Page summaries from a MediaWiki REST endpoint.
pub struct WikipediaKnowledge {
    base_url: String,
    max_chars: usize,
    timeout: Duration,
}

#[derive(Deserialize)]
struct PageSummary {
    #[serde(default)]
    title: String,
    #[serde(default)]
    extract: String,
}

impl WikipediaKnowledge {
    pub fn new(base_url: impl Into<String>, max_chars: usize, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_chars,
            timeout,
        }
    }

    fn summary_url(&self, title: &str) -> Result<reqwest::Url, NarratorError> {
        let bad = |detail: String| {
            NarratorError::Configuration(format!("knowledge.wikipedia_base_url: {detail}"))
        };
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| bad(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| bad("cannot be a base".into()))?
            .pop_if_empty()
            .extend(["api", "rest_v1", "page", "summary"])
            .push(&title.trim().replace(' ', "_"));
        Ok(url)
    }
}

#[async_trait]
impl KnowledgeSource for WikipediaKnowledge {
    fn name(&self) -> &str {
        "wikipedia"
    }

    async fn lookup(&self, query: &str) -> Result<Option<String>, NarratorError> {
        if query.trim().is_empty() {
            return Ok(None);
        }
        let url = self.summary_url(query)?;
        debug!(%url, "wikipedia summary request");

        let resp = shared_client()
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| NarratorError::tool("lookup_external_knowledge", e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(NarratorError::tool(
                "lookup_external_knowledge",
                format!("wikipedia returned {status}"),
            ));
        }

        let page: PageSummary = resp
            .json()
            .await
            .map_err(|e| NarratorError::tool("lookup_external_knowledge", e.to_string()))?;
        if page.extract.trim().is_empty() {
            return Ok(None);
        }
        let text = if page.title.is_empty() {
            page.extract
        } else {
            format!("{}: {}", page.title, page.extract)
        };
        Ok(Some(truncate_chars(&text, self.max_chars)))
    }
}

/// Ordered set of knowledge sources.
#[derive(Clone, Default)]
pub struct KnowledgeBase {
    sources: Vec<Arc<dyn KnowledgeSource>>,
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("KnowledgeBase").field("sources", &names).finish()
    }
}

impl KnowledgeBase {
    pub fn new(sources: Vec<Arc<dyn KnowledgeSource>>) -> Self {
        Self { sources }
    }

    pub fn from_config(config: &KnowledgeConfig) -> Self {
        let mut sources: Vec<Arc<dyn KnowledgeSource>> = Vec::new();
        if let Some(file) = &config.file {
            sources.push(Arc::new(FileKnowledge::new(file, config.max_chars)));
        }
        if config.wikipedia {
            sources.push(Arc::new(WikipediaKnowledge::new(
                config.wikipedia_base_url.clone(),
                config.max_chars,
                Duration::from_secs(config.timeout_secs),
            )));
        }
        Self { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub async fn lookup(&self, query: &str) -> KnowledgeAnswer {
        let mut answer = KnowledgeAnswer {
            query: query.to_string(),
            ..Default::default()
        };
        let mut parts = Vec::new();
        let mut errors = Vec::new();

        for source in &self.sources {
            match source.lookup(query).await {
                Ok(Some(text)) => {
                    answer.sources.push(source.name().to_string());
                    parts.push(text);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(source = source.name(), error = %e, "knowledge lookup failed");
                    errors.push(format!("{}: {e}", source.name()));
                }
            }
        }

        answer.summary = parts.join("\n\n");
        if !errors.is_empty() {
            answer.degraded = true;
            answer.error = Some(errors.join("; "));
        }
        answer
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => truncate_utf8(text, cut),
        None => text.to_string(),
    }
}
