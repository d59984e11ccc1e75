//! Login collaborator: turns credentials into session cookies before any
//! mirroring fetch happens.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, RcDom};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{ClientBuilder, Method};
use tracing::{debug, info};
use url::Url;

use crate::downloader::SessionCookie;
use crate::error::{AuthError, FetchError};
use crate::html_parser::{attribute, descendants, element_name};

#[derive(Clone)]
pub struct Credentials {
    pub login_url: Url,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login_url", &self.login_url.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Vec<SessionCookie>, AuthError>> + Send;
}

/// Submits the first password form found on the login page.
#[derive(Debug, Clone)]
pub struct FormLogin {
    user_agent: String,
    timeout: Duration,
}

impl FormLogin {
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.into(),
            timeout,
        }
    }
}

impl Authenticator for FormLogin {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Vec<SessionCookie>, AuthError> {
        let jar = Arc::new(Jar::default());
        let client = ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .cookie_provider(Arc::clone(&jar))
            .build()
            .map_err(AuthError::Client)?;

        info!(url = %credentials.login_url, "opening login page");
        let page = client
            .get(credentials.login_url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::LoginPage {
                url: credentials.login_url.clone(),
                source: login_page_error(e),
            })?;
        let page_url = page.url().clone();
        let html = page.text().await.map_err(|e| AuthError::LoginPage {
            url: credentials.login_url.clone(),
            source: FetchError::from(e),
        })?;

        let form = find_login_form(&html, &page_url)
            .ok_or_else(|| AuthError::FormNotFound(page_url.clone()))?;
        let fields = form.fill(&credentials.username, &credentials.password);
        debug!(action = %form.action, method = %form.method, "submitting login form");

        let request = if form.method == Method::GET {
            client.get(form.action.clone()).query(&fields)
        } else {
            client.post(form.action.clone()).form(&fields)
        };
        let response = request.send().await.map_err(FetchError::from)?;
        if !response.status().is_success() {
            return Err(AuthError::Rejected(form.action));
        }
        let landed = response.url().clone();
        let body = response.text().await.map_err(FetchError::from)?;
        if find_login_form(&body, &landed).is_some() {
            return Err(AuthError::Rejected(form.action));
        }

        let cookies = jar
            .cookies(&credentials.login_url)
            .and_then(|header| header.to_str().ok().map(parse_cookie_header))
            .unwrap_or_default();
        if cookies.is_empty() {
            return Err(AuthError::Rejected(form.action));
        }
        info!(count = cookies.len(), "login succeeded");
        Ok(cookies)
    }
}

fn login_page_error(err: reqwest::Error) -> FetchError {
    match err.status() {
        Some(status) => FetchError::Status(status.as_u16()),
        None => FetchError::from(err),
    }
}

#[derive(Debug, Clone)]
struct LoginForm {
    action: Url,
    method: Method,
    hidden: Vec<(String, String)>,
    username_field: Option<String>,
    password_field: String,
}

impl LoginForm {
    fn fill(&self, username: &str, password: &str) -> Vec<(String, String)> {
        let mut fields = self.hidden.clone();
        if let Some(name) = &self.username_field {
            fields.push((name.clone(), username.to_string()));
        }
        fields.push((self.password_field.clone(), password.to_string()));
        fields
    }
}

/// First `<form>` on the page that contains a password input.
fn find_login_form(html: &str, page_url: &Url) -> Option<LoginForm> {
    let dom = parse_document(RcDom::default(), Default::default()).one(html);
    let forms: Vec<Handle> = descendants(&dom.document)
        .into_iter()
        .filter(|node| element_name(node).as_deref() == Some("form"))
        .collect();
    forms.iter().find_map(|form| read_form(form, page_url))
}

fn read_form(form: &Handle, page_url: &Url) -> Option<LoginForm> {
    let mut hidden = Vec::new();
    let mut named_username = None;
    let mut first_text = None;
    let mut password_field = None;

    for input in descendants(form)
        .into_iter()
        .filter(|node| element_name(node).as_deref() == Some("input"))
    {
        let Some(name) = attribute(&input, "name").filter(|n| !n.is_empty()) else {
            continue;
        };
        let kind = attribute(&input, "type")
            .unwrap_or_else(|| "text".to_string())
            .to_ascii_lowercase();
        match kind.as_str() {
            "password" if password_field.is_none() => password_field = Some(name),
            "hidden" => hidden.push((name, attribute(&input, "value").unwrap_or_default())),
            "text" | "email" => {
                if name.eq_ignore_ascii_case("username") {
                    named_username = Some(name.clone());
                }
                if first_text.is_none() && password_field.is_none() {
                    first_text = Some(name);
                }
            }
            _ => {}
        }
    }

    let password_field = password_field?;
    let action = match attribute(form, "action").filter(|a| !a.trim().is_empty()) {
        Some(action) => page_url.join(action.trim()).ok()?,
        None => page_url.clone(),
    };
    let method = match attribute(form, "method") {
        Some(m) if m.eq_ignore_ascii_case("get") => Method::GET,
        _ => Method::POST,
    };

    Some(LoginForm {
        action,
        method,
        hidden,
        username_field: named_username.or(first_text),
        password_field,
    })
}

/// Splits a `Cookie:` header value (`a=1; b=2`) into pairs.
fn parse_cookie_header(header: &str) -> Vec<SessionCookie> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (!name.is_empty()).then(|| SessionCookie::new(name, value))
        })
        .collect()
}
