//! Authenticated HTTP session layer for bidwatch.
//!
//! Owns the cookie-backed portal session, the run-wide request pacer, the
//! retry/backoff policy, and the login-form replay authenticator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "bidwatch-client";

const EMAIL_SELECTOR: &str = "input#input-email, input[type='email'], input[name='email']";
const PASSWORD_SELECTOR: &str = "input[type='password'], input#password";

/// Portal account credentials.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Bounded polling policy for the login flow's suspension points.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            request_delay: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Serializes outbound calls so consecutive requests across the whole run are
/// at least `min_interval` apart. The lock is held across the sleep, which is
/// what makes the delay run-wide rather than per caller.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn pace(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready = prev + self.min_interval;
            if Instant::now() < ready {
                sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body for {url} is not JSON")]
    InvalidBody { url: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login step '{step}': no element matching {selector:?}")]
    ElementNotFound {
        step: &'static str,
        selector: &'static str,
    },
    #[error("login step '{step}' timed out after {attempts} polls")]
    StepTimedOut { step: &'static str, attempts: usize },
    #[error("login step '{step}' returned http status {status}")]
    HttpStatus { step: &'static str, status: u16 },
    #[error("login step '{step}' failed: {source}")]
    Request {
        step: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Authenticated call context shared by every fetcher in a run.
#[derive(Debug)]
pub struct PortalSession {
    client: reqwest::Client,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl PortalSession {
    pub fn new(client: reqwest::Client, config: &HttpClientConfig) -> Self {
        Self {
            client,
            pacer: RequestPacer::new(config.request_delay),
            backoff: config.backoff,
        }
    }

    /// Session without a login flow, for endpoints that happen to answer
    /// anonymously and for tests.
    pub fn unauthenticated(config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self::new(build_client(config)?, config))
    }

    /// Rate-limited GET returning the JSON payload of the response.
    ///
    /// Retries per the backoff policy; a body that fails JSON extraction
    /// counts as a retryable miss, matching how flaky interstitial pages
    /// behave on the portal.
    pub async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }
            self.pacer.pace().await;

            let response = match self.client.get(url).send().await {
                Ok(response) => response,
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, attempt, error = %err, "request error, will retry");
                        last_error = Some(FetchError::Request(err));
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            };

            let status = response.status();
            let final_url = response.url().to_string();
            if !status.is_success() {
                if classify_status(status) == RetryDisposition::Retryable
                    && attempt < self.backoff.max_retries
                {
                    debug!(url, attempt, %status, "http status, will retry");
                    last_error = Some(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                    continue;
                }
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = response.text().await?;
            match extract_json_payload(&body) {
                Some(value) => return Ok(value),
                None => {
                    debug!(url, attempt, "body not JSON, will retry");
                    last_error = Some(FetchError::InvalidBody { url: final_url });
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::InvalidBody {
            url: url.to_string(),
        }))
    }
}

/// Pull the JSON value out of a response body.
///
/// The portal's data endpoints answer plain JSON to API clients but wrap the
/// same payload in `<pre>` when the session gets bounced through an HTML
/// interstitial, so both shapes are accepted.
pub fn extract_json_payload(body: &str) -> Option<JsonValue> {
    if let Ok(value) = serde_json::from_str(body.trim()) {
        return Some(value);
    }

    let document = Html::parse_document(body);
    let pre = Selector::parse("pre").expect("static selector");
    let text = document
        .select(&pre)
        .next()
        .map(|node| node.text().collect::<String>())?;
    serde_json::from_str(text.trim()).ok()
}

fn build_client(config: &HttpClientConfig) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .cookie_store(true)
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build()
}

/// A login form located on a page: submit target, the name of the input the
/// flow fills in, and every other field to round-trip unchanged.
#[derive(Debug, Clone)]
pub struct LoginForm {
    pub action: Option<String>,
    pub field_name: String,
    pub fields: Vec<(String, String)>,
}

/// Locate the form containing an input matching `selector` and capture all of
/// its submittable fields, hidden inputs included.
pub fn find_input_form(body: &str, selector: &str) -> Option<LoginForm> {
    let document = Html::parse_document(body);
    let input_sel = Selector::parse(selector).ok()?;
    let input = document.select(&input_sel).next()?;
    let field_name = input.value().attr("name").unwrap_or("email").to_string();

    let form = input
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "form");
    let action = form
        .and_then(|f| f.value().attr("action"))
        .map(ToString::to_string);

    let all_inputs = Selector::parse("input").expect("static selector");
    let scope = form.unwrap_or_else(|| document.root_element());
    let mut fields = Vec::new();
    for node in scope.select(&all_inputs) {
        let name = match node.value().attr("name") {
            Some(n) if !n.is_empty() => n,
            _ => continue,
        };
        let input_type = node.value().attr("type").unwrap_or("text").to_lowercase();
        // Buttons only submit when clicked; unchecked toggles not at all.
        if matches!(input_type.as_str(), "submit" | "image" | "button") {
            continue;
        }
        if matches!(input_type.as_str(), "radio" | "checkbox")
            && node.value().attr("checked").is_none()
        {
            continue;
        }
        let value = node.value().attr("value").unwrap_or_default().to_string();
        fields.push((name.to_string(), value));
    }

    Some(LoginForm {
        action,
        field_name,
        fields,
    })
}

/// Clone the captured fields with one value overridden (added when absent).
pub fn override_field(fields: &[(String, String)], name: &str, value: &str) -> Vec<(String, String)> {
    let mut params = fields.to_vec();
    match params.iter_mut().find(|(n, _)| n == name) {
        Some(existing) => existing.1 = value.to_string(),
        None => params.push((name.to_string(), value.to_string())),
    }
    params
}

fn has_login_inputs(body: &str) -> bool {
    let document = Html::parse_document(body);
    for selector in [EMAIL_SELECTOR, PASSWORD_SELECTOR] {
        let sel = Selector::parse(selector).expect("static selector");
        if document.select(&sel).next().is_some() {
            return true;
        }
    }
    false
}

fn resolve_action(page_url: &str, action: Option<&str>) -> String {
    let Some(action) = action.filter(|a| !a.trim().is_empty()) else {
        return page_url.to_string();
    };
    match Url::parse(page_url).and_then(|base| base.join(action)) {
        Ok(url) => url.to_string(),
        Err(_) => action.to_string(),
    }
}

/// Obtain-authenticated-session capability. Downstream fetchers only see the
/// resulting [`PortalSession`], so the mechanism (HTTP replay here, a driven
/// browser elsewhere) is swappable.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<PortalSession, AuthError>;
}

/// Replays the portal's two-step login form over plain HTTP: submit the email,
/// wait for the password form to render, submit the password, wait for the
/// login form to disappear. Session state lives in the client's cookie jar.
#[derive(Debug, Clone)]
pub struct FormLoginAuthenticator {
    login_url: String,
    http: HttpClientConfig,
    wait: WaitPolicy,
}

impl FormLoginAuthenticator {
    pub fn new(login_url: impl Into<String>, http: HttpClientConfig) -> Self {
        Self {
            login_url: login_url.into(),
            http,
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    async fn get_page(
        &self,
        client: &reqwest::Client,
        url: &str,
        step: &'static str,
    ) -> Result<(String, String), AuthError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|source| AuthError::Request { step, source })?;
        Self::read_page(response, step).await
    }

    async fn post_form(
        &self,
        client: &reqwest::Client,
        url: &str,
        params: &[(String, String)],
        step: &'static str,
    ) -> Result<(String, String), AuthError> {
        let response = client
            .post(url)
            .form(params)
            .send()
            .await
            .map_err(|source| AuthError::Request { step, source })?;
        Self::read_page(response, step).await
    }

    async fn read_page(
        response: reqwest::Response,
        step: &'static str,
    ) -> Result<(String, String), AuthError> {
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::HttpStatus {
                step,
                status: status.as_u16(),
            });
        }
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|source| AuthError::Request { step, source })?;
        Ok((body, final_url))
    }
}

#[async_trait]
impl Authenticator for FormLoginAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<PortalSession, AuthError> {
        let client = build_client(&self.http).map_err(|source| AuthError::Request {
            step: "session setup",
            source,
        })?;

        let (body, page_url) = self.get_page(&client, &self.login_url, "open login page").await?;
        let email_form =
            find_input_form(&body, EMAIL_SELECTOR).ok_or(AuthError::ElementNotFound {
                step: "email form",
                selector: EMAIL_SELECTOR,
            })?;
        debug!(field = %email_form.field_name, "located email form");

        let action = resolve_action(&page_url, email_form.action.as_deref());
        let params = override_field(&email_form.fields, &email_form.field_name, &credentials.email);
        let (mut body, mut page_url) = self
            .post_form(&client, &action, &params, "submit email")
            .await?;

        // The password form renders after a client-side transition; poll for
        // it a bounded number of times.
        let mut password_form = find_input_form(&body, PASSWORD_SELECTOR);
        let mut polls = 0;
        while password_form.is_none() && polls < self.wait.attempts {
            sleep(self.wait.delay).await;
            polls += 1;
            let (next_body, next_url) = self
                .get_page(&client, &page_url, "await password form")
                .await?;
            body = next_body;
            page_url = next_url;
            password_form = find_input_form(&body, PASSWORD_SELECTOR);
        }
        let password_form = password_form.ok_or(AuthError::StepTimedOut {
            step: "await password form",
            attempts: self.wait.attempts,
        })?;

        let action = resolve_action(&page_url, password_form.action.as_deref());
        let params = override_field(
            &password_form.fields,
            &password_form.field_name,
            &credentials.password,
        );
        let (mut body, mut page_url) = self
            .post_form(&client, &action, &params, "submit password")
            .await?;

        // Logged in once the login form stops rendering.
        let mut polls = 0;
        while has_login_inputs(&body) && polls < self.wait.attempts {
            sleep(self.wait.delay).await;
            polls += 1;
            let (next_body, next_url) =
                self.get_page(&client, &page_url, "await logged-in page").await?;
            body = next_body;
            page_url = next_url;
        }
        if has_login_inputs(&body) {
            warn!(email = %credentials.email, "login form still rendered after password submit");
            return Err(AuthError::StepTimedOut {
                step: "await logged-in page",
                attempts: self.wait.attempts,
            });
        }

        Ok(PortalSession::new(client, &self.http))
    }
}
