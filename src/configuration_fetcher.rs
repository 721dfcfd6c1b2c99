//! An HTTP client that fetches configuration from the CDN.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;
use reqwest::{header, StatusCode, Url};

use crate::{configuration::Configuration, logger::ClientLogger, models::RedirectMode, Error};

/// Name of the user agent header.
pub(crate) const USER_AGENT_HEADER: &str = "X-ConfigCat-UserAgent";

const CONFIG_FILE_NAME: &str = "config_v5.json";

/// A redirect may be followed at most this many times within one fetch.
const MAX_REDIRECTS: u32 = 2;

pub(crate) struct ConfigurationFetcherConfig {
    pub sdk_key: String,
    pub base_url: String,
    /// Whether `base_url` was set by the user. Custom URLs are only replaced by forced
    /// redirects.
    pub base_url_overridden: bool,
    /// Polling mode identifier, reported in the user agent.
    pub mode: &'static str,
    pub request_timeout: Duration,
}

/// Result of a single fetch.
#[derive(Debug)]
pub(crate) enum FetchResult {
    /// A new document was downloaded.
    Fetched(Configuration),
    /// The server confirmed that the document identified by the ETag is still current.
    NotModified,
    /// The fetch failed.
    Failed(Error),
}

/// A client that fetches configuration documents from the server.
pub(crate) struct ConfigurationFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    sdk_key: String,
    user_agent: String,
    base_url: Mutex<String>,
    base_url_overridden: bool,
    closed: AtomicBool,
    logger: Arc<ClientLogger>,
}

impl ConfigurationFetcher {
    pub fn new(
        config: ConfigurationFetcherConfig,
        logger: Arc<ClientLogger>,
    ) -> crate::Result<ConfigurationFetcher> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(ConfigurationFetcher {
            client,
            sdk_key: config.sdk_key,
            user_agent: format!(
                "ConfigCat-Rust/{}-{}",
                config.mode,
                env!("CARGO_PKG_VERSION")
            ),
            base_url: Mutex::new(config.base_url),
            base_url_overridden: config.base_url_overridden,
            closed: AtomicBool::new(false),
            logger,
        })
    }

    /// Base URL the next request goes to.
    pub fn base_url(&self) -> String {
        self.base_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop issuing requests. Fetches started afterwards fail with [`Error::ClientClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Fetch the configuration, following CDN redirects.
    pub async fn fetch(&self, previous_etag: Option<&str>) -> FetchResult {
        let mut redirects = 0;
        loop {
            let result = self.fetch_once(previous_etag).await;

            let FetchResult::Fetched(configuration) = &result else {
                return result;
            };
            let Some(preferences) = &configuration.config.preferences else {
                return result;
            };
            let Some(new_url) = preferences.base_url.as_deref().filter(|url| !url.is_empty())
            else {
                return result;
            };

            {
                let mut base_url = self.base_url.lock().unwrap_or_else(PoisonError::into_inner);
                if *base_url == new_url {
                    return result;
                }
                if self.base_url_overridden && preferences.redirect != RedirectMode::ForceRedirect
                {
                    return result;
                }
                *base_url = new_url.to_owned();
            }

            match preferences.redirect {
                RedirectMode::NoRedirect => return result,
                RedirectMode::ShouldRedirect => self.logger.warn(
                    3002,
                    "the data_governance parameter specified at client initialization does not \
                     match the one of the configuration; make sure to set it to the right value",
                ),
                RedirectMode::ForceRedirect => {}
            }

            if redirects >= MAX_REDIRECTS {
                self.logger.error(
                    1104,
                    "redirection loop encountered while fetching the configuration",
                    None,
                );
                return result;
            }
            redirects += 1;
            self.logger
                .debug(0, format_args!("following redirect to {new_url}"));
        }
    }

    async fn fetch_once(&self, previous_etag: Option<&str>) -> FetchResult {
        if self.closed.load(Ordering::SeqCst) {
            return FetchResult::Failed(Error::ClientClosed);
        }

        let url = match self.config_url() {
            Ok(url) => url,
            Err(err) => {
                self.logger
                    .error(1103, "cannot build configuration URL", Some(&err));
                return FetchResult::Failed(err);
            }
        };

        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT_HEADER, &self.user_agent);
        if let Some(etag) = previous_etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }

        log::debug!(target: "flagpole", etag = previous_etag; "fetching configuration");
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return self.network_failure(err),
        };

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => {
                log::debug!(target: "flagpole", "configuration not modified");
                FetchResult::NotModified
            }
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                let err = Error::InvalidSdkKey(status.as_u16());
                self.logger.error(
                    1100,
                    "your SDK key seems to be wrong; you can find the valid SDK key at \
                     https://app.configcat.com/sdkkey",
                    Some(&err),
                );
                FetchResult::Failed(err)
            }
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|etag| etag.to_str().ok())
                    .map(str::to_owned);
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(err) => return self.network_failure(err),
                };
                match Configuration::from_json(body, etag, Utc::now()) {
                    Ok(configuration) => {
                        log::debug!(target: "flagpole", etag = configuration.etag.as_deref(); "successfully fetched configuration");
                        FetchResult::Fetched(configuration)
                    }
                    Err(err) => {
                        self.logger
                            .error(1105, "fetched configuration is malformed", Some(&err));
                        FetchResult::Failed(err)
                    }
                }
            }
            status => {
                let err = Error::HttpStatus(status.as_u16());
                self.logger.error(
                    1101,
                    "unexpected HTTP response received while fetching the configuration",
                    Some(&err),
                );
                FetchResult::Failed(err)
            }
        }
    }

    fn network_failure(&self, err: reqwest::Error) -> FetchResult {
        let message = if err.is_timeout() {
            "request timed out while fetching the configuration"
        } else {
            "network error while fetching the configuration"
        };
        let err = Error::from(err);
        self.logger.error(1102, message, Some(&err));
        FetchResult::Failed(err)
    }

    fn config_url(&self) -> crate::Result<Url> {
        let base_url = self.base_url();
        let url = format!(
            "{}/configuration-files/{}/{CONFIG_FILE_NAME}",
            base_url.trim_end_matches('/'),
            self.sdk_key
        );
        Url::parse(&url).map_err(Error::InvalidBaseUrl)
    }
}
