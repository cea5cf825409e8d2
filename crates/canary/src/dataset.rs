//! Dataset resolution against the historian namespace.
//!
//! Discovers which dataset of the configured prefix family (`<Prefix>`,
//! `<Prefix>2`, …) contains a tag whose full path equals the canonical
//! dot-path, deep-browsing with a continuation token. Resolutions are cached
//! per path. An override forces a fixed dataset (validation runs) and is the
//! only mode in which auto-creation applies.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use sync_core::{Error, Result};
use tracing::debug;

use crate::config::CanaryConfig;

/// One page of a namespace browse.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrowsePage {
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub continuation: Option<String>,
}

/// Namespace browse transport; tests script pages, production goes over
/// HTTP.
#[async_trait]
pub trait NamespaceBrowser: Send + Sync {
    async fn browse(
        &self,
        path: &str,
        deep: bool,
        continuation: Option<&str>,
    ) -> Result<BrowsePage>;
}

/// HTTP browser against the historian's browse endpoint.
pub struct HttpNamespaceBrowser {
    http: reqwest::Client,
    endpoint: String,
    api_token: String,
    page_size: usize,
}

impl HttpNamespaceBrowser {
    pub fn new(config: &CanaryConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: format!("{}/browseTags", config.base_url.trim_end_matches('/')),
            api_token: config.api_token.clone(),
            page_size: 1000,
        }
    }
}

#[async_trait]
impl NamespaceBrowser for HttpNamespaceBrowser {
    async fn browse(
        &self,
        path: &str,
        deep: bool,
        continuation: Option<&str>,
    ) -> Result<BrowsePage> {
        let mut body = json!({
            "apiToken": self.api_token,
            "path": path,
            "deep": deep,
            "maxSize": self.page_size,
        });
        if let Some(continuation) = continuation {
            body["continuation"] = json!(continuation);
        }

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| Error::transient(format!("browse request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: "browse rejected".into(),
            });
        }
        response
            .json::<BrowsePage>()
            .await
            .map_err(|err| Error::transient(format!("browse body unreadable: {err}")))
    }
}

/// Resolves canonical paths to dataset names, caching hits.
pub struct DatasetResolver {
    browser: Box<dyn NamespaceBrowser>,
    prefix: String,
    override_dataset: Option<String>,
    cache: RwLock<HashMap<String, String>>,
}

impl DatasetResolver {
    pub fn new(browser: Box<dyn NamespaceBrowser>, config: &CanaryConfig) -> Self {
        Self {
            browser,
            prefix: config.dataset_prefix.clone(),
            override_dataset: config.dataset_override.clone(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Locate the dataset containing `canary_id`.
    ///
    /// Fails with `DatasetNotFound` when no dataset of the prefix family
    /// holds an exact match; the egress client treats that as
    /// dead-letter-eligible.
    pub async fn resolve(&self, canary_id: &str) -> Result<String> {
        if let Some(forced) = &self.override_dataset {
            return Ok(forced.clone());
        }
        if let Some(hit) = self.cache.read().get(canary_id) {
            return Ok(hit.clone());
        }

        for dataset in self.candidate_datasets().await? {
            if self.dataset_contains(&dataset, canary_id).await? {
                debug!(dataset = %dataset, canary_id = %canary_id, "dataset resolved");
                self.cache
                    .write()
                    .insert(canary_id.to_string(), dataset.clone());
                return Ok(dataset);
            }
        }
        Err(Error::DatasetNotFound(canary_id.to_string()))
    }

    /// Datasets of the prefix family, discovered from a shallow root
    /// browse.
    async fn candidate_datasets(&self) -> Result<Vec<String>> {
        let mut continuation: Option<String> = None;
        let mut candidates = Vec::new();
        loop {
            let page = self
                .browser
                .browse("", false, continuation.as_deref())
                .await?;
            candidates.extend(
                page.datasets
                    .into_iter()
                    .filter(|name| self.prefix.is_empty() || name.starts_with(&self.prefix)),
            );
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        // Family order: the bare prefix first, then numbered members.
        candidates.sort();
        Ok(candidates)
    }

    async fn dataset_contains(&self, dataset: &str, canary_id: &str) -> Result<bool> {
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .browser
                .browse(dataset, true, continuation.as_deref())
                .await?;
            if page.tags.iter().any(|tag| tag == canary_id) {
                return Ok(true);
            }
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedBrowser {
        /// (path, continuation) → page
        pages: Mutex<HashMap<(String, Option<String>), BrowsePage>>,
    }

    impl ScriptedBrowser {
        fn new(pages: Vec<((&str, Option<&str>), BrowsePage)>) -> Self {
            Self {
                pages: Mutex::new(
                    pages
                        .into_iter()
                        .map(|((path, cont), page)| {
                            ((path.to_string(), cont.map(String::from)), page)
                        })
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl NamespaceBrowser for ScriptedBrowser {
        async fn browse(
            &self,
            path: &str,
            _deep: bool,
            continuation: Option<&str>,
        ) -> Result<BrowsePage> {
            Ok(self
                .pages
                .lock()
                .get(&(path.to_string(), continuation.map(String::from)))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn config(prefix: &str, override_dataset: Option<&str>) -> CanaryConfig {
        CanaryConfig {
            dataset_prefix: prefix.into(),
            dataset_override: override_dataset.map(String::from),
            ..CanaryConfig::default()
        }
    }

    #[tokio::test]
    async fn resolves_across_prefix_family_with_continuation() {
        let browser = ScriptedBrowser::new(vec![
            (
                ("", None),
                BrowsePage {
                    datasets: vec!["Secil".into(), "Secil2".into(), "Other".into()],
                    ..BrowsePage::default()
                },
            ),
            (
                ("Secil", None),
                BrowsePage {
                    tags: vec!["Secil.EdgeA.D.M1".into()],
                    continuation: Some("c1".into()),
                    ..BrowsePage::default()
                },
            ),
            (
                ("Secil", Some("c1")),
                BrowsePage {
                    tags: vec!["Secil.EdgeA.D.M2".into()],
                    ..BrowsePage::default()
                },
            ),
            (
                ("Secil2", None),
                BrowsePage {
                    tags: vec!["Secil2.EdgeB.D.M9".into()],
                    ..BrowsePage::default()
                },
            ),
        ]);
        let resolver = DatasetResolver::new(Box::new(browser), &config("Secil", None));

        // Found on the second page of the first dataset.
        assert_eq!(resolver.resolve("Secil.EdgeA.D.M2").await.unwrap(), "Secil");
        // Found in the second family member.
        assert_eq!(
            resolver.resolve("Secil2.EdgeB.D.M9").await.unwrap(),
            "Secil2"
        );
    }

    #[tokio::test]
    async fn unresolved_path_is_dataset_not_found() {
        let browser = ScriptedBrowser::new(vec![(
            ("", None),
            BrowsePage {
                datasets: vec!["Secil".into()],
                ..BrowsePage::default()
            },
        )]);
        let resolver = DatasetResolver::new(Box::new(browser), &config("Secil", None));
        let err = resolver.resolve("Secil.Missing.Tag").await.unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound(_)));
    }

    #[tokio::test]
    async fn override_bypasses_browsing_entirely() {
        let browser = ScriptedBrowser::new(vec![]);
        let resolver =
            DatasetResolver::new(Box::new(browser), &config("Secil", Some("Validation")));
        assert_eq!(
            resolver.resolve("Secil.Any.Path").await.unwrap(),
            "Validation"
        );
    }

    #[tokio::test]
    async fn cache_short_circuits_repeat_lookups() {
        let browser = ScriptedBrowser::new(vec![
            (
                ("", None),
                BrowsePage {
                    datasets: vec!["Secil".into()],
                    ..BrowsePage::default()
                },
            ),
            (
                ("Secil", None),
                BrowsePage {
                    tags: vec!["Secil.T".into()],
                    ..BrowsePage::default()
                },
            ),
        ]);
        let resolver = DatasetResolver::new(Box::new(browser), &config("Secil", None));

        resolver.resolve("Secil.T").await.unwrap();
        assert_eq!(resolver.cache.read().len(), 1);
        // A second resolve is served from the cache even if the namespace
        // were to disappear underneath us.
        resolver.cache.write().insert("Secil.T".into(), "Secil".into());
        assert_eq!(resolver.resolve("Secil.T").await.unwrap(), "Secil");
    }
}
