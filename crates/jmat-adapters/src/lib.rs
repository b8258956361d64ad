//! Job-board adapter contracts + Greenhouse/Lever implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jmat_core::{JobId, JobPosting};
use jmat_storage::{FetchError, HttpFetcher};
use scraper::Html;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jmat-adapters";

pub const GREENHOUSE_API_BASE: &str = "https://boards-api.greenhouse.io";
pub const LEVER_API_BASE: &str = "https://api.lever.co";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {source_id} board {company:?}: {source}")]
    Fetch {
        source_id: &'static str,
        company: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding {source_id} board {company:?}: {reason}")]
    Decode {
        source_id: &'static str,
        company: String,
        reason: String,
    },
    #[error("no adapter registered for source {0:?}")]
    UnknownSource(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn listing_url(&self, company: &str) -> String;

    fn parse_listing(&self, company: &str, body: &[u8]) -> Result<Vec<JobPosting>, AdapterError>;

    async fn fetch_company(
        &self,
        http: &HttpFetcher,
        run_id: Uuid,
        company: &str,
    ) -> Result<Vec<JobPosting>, AdapterError> {
        let url = self.listing_url(company);
        let response = http
            .fetch_bytes(run_id, self.source_id(), &url)
            .await
            .map_err(|source| AdapterError::Fetch {
                source_id: self.source_id(),
                company: company.to_string(),
                source,
            })?;
        let postings = self.parse_listing(company, &response.body)?;
        info!(
            source_id = self.source_id(),
            company,
            postings = postings.len(),
            "fetched job board"
        );
        Ok(postings)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub companies: Vec<String>,
    /// Overrides the public API base, mainly for tests and proxies.
    #[serde(default)]
    pub api_base: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading source registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing source registry {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl SourceRegistry {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| RegistryError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct GreenhouseAdapter {
    api_base: String,
}

impl Default for GreenhouseAdapter {
    fn default() -> Self {
        Self::new(GREENHOUSE_API_BASE)
    }
}

impl GreenhouseAdapter {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GreenhouseBoard {
    #[serde(default)]
    jobs: Vec<GreenhouseJob>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseJob {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    absolute_url: String,
    #[serde(default)]
    location: Option<GreenhouseNamed>,
    #[serde(default)]
    departments: Vec<GreenhouseNamed>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseNamed {
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl SourceAdapter for GreenhouseAdapter {
    fn source_id(&self) -> &'static str {
        "greenhouse"
    }

    fn listing_url(&self, company: &str) -> String {
        format!("{}/v1/boards/{}/jobs?content=true", self.api_base, company.trim())
    }

    fn parse_listing(&self, company: &str, body: &[u8]) -> Result<Vec<JobPosting>, AdapterError> {
        let board: GreenhouseBoard =
            serde_json::from_slice(body).map_err(|e| AdapterError::Decode {
                source_id: self.source_id(),
                company: company.to_string(),
                reason: e.to_string(),
            })?;

        Ok(board
            .jobs
            .into_iter()
            .map(|job| JobPosting {
                id: JobId::new(self.source_id(), &job.id.to_string()),
                title: job.title.trim().to_string(),
                description: job.content.as_deref().map(html_to_text).unwrap_or_default(),
                company: company.to_string(),
                location: job.location.and_then(|l| l.name).unwrap_or_default(),
                department: job
                    .departments
                    .into_iter()
                    .next()
                    .and_then(|d| d.name)
                    .unwrap_or_default(),
                url: job.absolute_url,
                source: self.source_id().to_string(),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct LeverAdapter {
    api_base: String,
}

impl Default for LeverAdapter {
    fn default() -> Self {
        Self::new(LEVER_API_BASE)
    }
}

impl LeverAdapter {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for LeverAdapter {
    fn source_id(&self) -> &'static str {
        "lever"
    }

    fn listing_url(&self, company: &str) -> String {
        format!("{}/v0/postings/{}?mode=json", self.api_base, company.trim())
    }

    fn parse_listing(&self, company: &str, body: &[u8]) -> Result<Vec<JobPosting>, AdapterError> {
        let decode_error = |reason: String| AdapterError::Decode {
            source_id: self.source_id(),
            company: company.to_string(),
            reason,
        };
        let value: JsonValue =
            serde_json::from_slice(body).map_err(|e| decode_error(e.to_string()))?;

        let postings = match &value {
            JsonValue::Array(items) => items.as_slice(),
            JsonValue::Object(map) => {
                if map.get("ok").and_then(JsonValue::as_bool) == Some(false) {
                    debug!(
                        company,
                        error = json_str(&value, &["error"]).unwrap_or("unknown"),
                        "lever board reported an error; treating as empty"
                    );
                    return Ok(Vec::new());
                }
                match map.get("data").and_then(JsonValue::as_array) {
                    Some(items) => items.as_slice(),
                    None => return Err(decode_error("object without a data array".to_string())),
                }
            }
            _ => return Err(decode_error("expected an array of postings".to_string())),
        };

        Ok(postings
            .iter()
            .enumerate()
            .map(|(index, posting)| {
                let native_id = json_str(posting, &["id"])
                    .map(ToString::to_string)
                    .unwrap_or_else(|| format!("{company}_{index}"));
                let description = match json_str(posting, &["descriptionPlain"]) {
                    Some(plain) => collapse_whitespace(plain),
                    None => json_str(posting, &["description"])
                        .map(html_to_text)
                        .unwrap_or_default(),
                };
                JobPosting {
                    id: JobId::new(self.source_id(), &native_id),
                    title: first_str(posting, &[&["text"], &["title"]]),
                    description,
                    company: company.to_string(),
                    location: first_str(
                        posting,
                        &[&["categories", "location"], &["location"], &["workplaceType"]],
                    ),
                    department: first_str(
                        posting,
                        &[&["categories", "department"], &["department"], &["team"]],
                    ),
                    url: first_str(posting, &[&["hostedUrl"], &["applyUrl"]]),
                    source: self.source_id().to_string(),
                }
            })
            .collect())
    }
}

pub fn adapter_for_source(source_id: &str) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    adapter_for_config(source_id, None)
}

pub fn adapter_for_config(
    source_id: &str,
    api_base: Option<&str>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match source_id {
        "greenhouse" => Ok(Box::new(
            api_base.map(GreenhouseAdapter::new).unwrap_or_default(),
        )),
        "lever" => Ok(Box::new(api_base.map(LeverAdapter::new).unwrap_or_default())),
        other => Err(AdapterError::UnknownSource(other.to_string())),
    }
}

/// Fetch every company of one source. A failing company is logged and
/// skipped so the rest of the batch still lands.
pub async fn fetch_source(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    run_id: Uuid,
    companies: &[String],
) -> (Vec<JobPosting>, usize) {
    let mut postings = Vec::new();
    let mut failures = 0usize;
    for company in companies {
        match adapter.fetch_company(http, run_id, company).await {
            Ok(mut batch) => postings.append(&mut batch),
            Err(err) => {
                failures += 1;
                warn!(source_id = adapter.source_id(), company = %company, error = %err, "skipping company");
            }
        }
    }
    (postings, failures)
}

/// Plain text from an HTML fragment. Greenhouse double-encodes its content,
/// so a first pass that still yields markup is parsed a second time.
pub fn html_to_text(html: &str) -> String {
    let once = fragment_text(html);
    if looks_like_markup(&once) {
        fragment_text(&once)
    } else {
        once
    }
}

fn fragment_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let joined = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    collapse_whitespace(&joined)
}

fn looks_like_markup(text: &str) -> bool {
    text.match_indices('<').any(|(idx, _)| {
        text[idx + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '/')
    }) && text.contains('>')
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn first_str(value: &JsonValue, paths: &[&[&str]]) -> String {
    paths
        .iter()
        .filter_map(|path| json_str(value, path))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jmat_storage::HttpClientConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture(source_id: &str) -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(source_id)
            .join("sample.json");
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    #[test]
    fn greenhouse_fixture_parses_into_postings() {
        let adapter = GreenhouseAdapter::default();
        let postings = adapter
            .parse_listing("figma", &fixture("greenhouse"))
            .expect("parse greenhouse fixture");

        assert_eq!(postings.len(), 3);
        let first = &postings[0];
        assert_eq!(first.id.as_str(), "greenhouse:4012345");
        assert_eq!(first.company, "figma");
        assert_eq!(first.location, "San Francisco, CA");
        assert_eq!(first.department, "Product");
        assert_eq!(first.url, "https://boards.greenhouse.io/figma/jobs/4012345");
        assert_eq!(
            first.description,
            "Own our platform infrastructure roadmap. Drive API design & integration strategy \
             Partner on Kubernetes and Terraform adoption"
        );

        let bare = &postings[2];
        assert_eq!(bare.location, "");
        assert_eq!(bare.department, "");
        assert_eq!(bare.description, "");
    }

    #[test]
    fn lever_fixture_falls_back_across_fields() {
        let adapter = LeverAdapter::default();
        let postings = adapter
            .parse_listing("benchling", &fixture("lever"))
            .expect("parse lever fixture");

        assert_eq!(postings.len(), 3);
        assert_eq!(postings[0].id.as_str(), "lever:8f1c2d7e-0001");
        assert_eq!(postings[0].location, "Remote - US");
        assert_eq!(postings[0].department, "Product");
        assert_eq!(postings[0].url, "https://jobs.lever.co/benchling/8f1c2d7e-0001");
        assert!(postings[0].description.starts_with("Lead our billing platform:"));

        let no_id = &postings[2];
        assert_eq!(no_id.id.as_str(), "lever:benchling_2");
        assert_eq!(no_id.title, "Group Product Lead");
        assert_eq!(no_id.location, "hybrid");
        assert_eq!(no_id.department, "Product");
        assert_eq!(no_id.url, "https://jobs.lever.co/benchling/no-id/apply");
        assert_eq!(
            no_id.description,
            "Internal tools & workflow automation for our teams."
        );
    }

    #[test]
    fn lever_accepts_wrapped_and_error_shapes() {
        let adapter = LeverAdapter::default();
        let wrapped = br#"{"data": [{"id": "a", "text": "Product Owner", "hostedUrl": "https://jobs.lever.co/x/a"}]}"#;
        assert_eq!(adapter.parse_listing("x", wrapped).unwrap().len(), 1);

        let error = br#"{"ok": false, "error": "Document not found"}"#;
        assert!(adapter.parse_listing("x", error).unwrap().is_empty());

        assert!(matches!(
            adapter.parse_listing("x", b"\"nope\""),
            Err(AdapterError::Decode { .. })
        ));
    }

    #[test]
    fn registry_resolves_known_sources_only() {
        assert_eq!(adapter_for_source("greenhouse").unwrap().source_id(), "greenhouse");
        assert_eq!(adapter_for_source("lever").unwrap().source_id(), "lever");
        assert!(matches!(
            adapter_for_source("workday"),
            Err(AdapterError::UnknownSource(_))
        ));
    }

    #[test]
    fn shipped_source_registry_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/sources.yaml");
        let registry = SourceRegistry::from_yaml_file(path).expect("sources.yaml");
        let ids = registry.enabled().map(|s| s.source_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["greenhouse", "lever"]);
        for source in registry.enabled() {
            assert!(adapter_for_source(&source.source_id).is_ok());
            assert!(!source.companies.is_empty());
        }
    }

    #[test]
    fn html_to_text_handles_plain_and_double_encoded_markup() {
        assert_eq!(html_to_text("<p>Hello <b>world</b></p>"), "Hello world");
        assert_eq!(html_to_text("&lt;p&gt;Hi&lt;/p&gt;"), "Hi");
        assert_eq!(html_to_text("a < b and c > d"), "a < b and c > d");
    }

    #[tokio::test]
    async fn fetch_source_skips_failing_companies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/boards/figma/jobs"))
            .and(query_param("content", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture("greenhouse")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/boards/gone/jobs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let adapter = GreenhouseAdapter::new(&server.uri());
        let (postings, failures) = fetch_source(
            &adapter,
            &http,
            Uuid::new_v4(),
            &["gone".to_string(), "figma".to_string()],
        )
        .await;

        assert_eq!(failures, 1);
        assert_eq!(postings.len(), 3);
        assert!(postings.iter().all(|p| p.source == "greenhouse"));
    }
}
