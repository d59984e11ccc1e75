use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::RangedU64ValueParser;
use clap::{ArgAction, Parser};
use console::Term;
use url::Url;

use crate::auth::Credentials;
use crate::downloader::{SessionCookie, DEFAULT_USER_AGENT};
use crate::mirror::{MirrorOptions, MirrorTarget};

#[derive(Parser, Debug)]
#[command(
    name = "page-mirror",
    about = "Mirror a web page and its images, stylesheets and scripts for offline viewing",
    version,
    long_about = "Downloads a single page plus the static assets it references, rewrites the page to use the local copies, and packs the result into a zip archive next to the output directory."
)]
pub struct MirrorCommand {
    /// URL of the page to mirror (asked for interactively when omitted)
    pub url: Option<String>,

    /// Output directory (defaults to ./<host>)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent asset downloads
    #[arg(
        short = 'c',
        long,
        default_value = "8",
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub max_concurrent: usize,

    /// Timeout for each request in seconds
    #[arg(long, default_value = "30", value_parser = RangedU64ValueParser::<u64>::new().range(1..))]
    pub timeout: u64,

    /// User agent string to use for requests
    #[arg(long, default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// The page requires a login before it can be mirrored
    #[arg(short = 'l', long)]
    pub login: bool,

    /// Page holding the login form (defaults to the page URL)
    #[arg(long)]
    pub login_url: Option<String>,

    /// Login user name (prompted when missing)
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Login password (prompted when missing)
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Extra cookie to send with every same-host request
    #[arg(long = "cookie", value_name = "NAME=VALUE", value_parser = parse_cookie)]
    pub cookies: Vec<SessionCookie>,

    /// Skip creating the zip archive
    #[arg(long)]
    pub no_archive: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Hide the progress bar
    #[arg(short, long)]
    pub quiet: bool,

    /// More log output (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Everything the orchestrator needs, after prompting.
#[derive(Debug)]
pub struct MirrorRequest {
    pub target: MirrorTarget,
    pub credentials: Option<Credentials>,
    pub options: MirrorOptions,
}

fn parse_cookie(raw: &str) -> Result<SessionCookie, String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok(SessionCookie::new(name.trim(), value.trim()))
        }
        _ => Err(format!("expected NAME=VALUE, got `{raw}`")),
    }
}

impl MirrorCommand {
    pub fn options(&self) -> MirrorOptions {
        MirrorOptions {
            max_concurrent: self.max_concurrent,
            timeout: Duration::from_secs(self.timeout),
            user_agent: self.user_agent.clone(),
            cookies: self.cookies.clone(),
            archive: !self.no_archive,
            show_progress: !self.quiet && !self.json,
        }
    }

    /// Fills in whatever the command line left out by asking on `term`.
    pub fn into_request(self, term: &Term) -> Result<MirrorRequest> {
        let options = self.options();
        let interactive = self.url.is_none();

        let url = match self.url {
            Some(url) => url,
            None => prompt(term, "Page URL: ")?,
        };
        if url.is_empty() {
            bail!("a page URL is required");
        }

        let target = match self.output_dir {
            Some(dir) => MirrorTarget::new(&url, dir)?,
            None => MirrorTarget::in_current_dir(&url)?,
        };

        let requires_login = self.login
            || self.username.is_some()
            || (interactive && confirm(term, "Does the page require login? (y/n): ")?);

        let credentials = if requires_login {
            let login_url = match &self.login_url {
                Some(raw) => Url::parse(raw).with_context(|| format!("invalid login URL `{raw}`"))?,
                None => target.root_url.clone(),
            };
            let username = match self.username {
                Some(username) => username,
                None => prompt(term, "Username: ")?,
            };
            let password = match self.password {
                Some(password) => password,
                None => {
                    term.write_str("Password: ")?;
                    term.read_secure_line()?
                }
            };
            Some(Credentials {
                login_url,
                username,
                password,
            })
        } else {
            None
        };

        Ok(MirrorRequest {
            target,
            credentials,
            options,
        })
    }
}

fn prompt(term: &Term, label: &str) -> io::Result<String> {
    term.write_str(label)?;
    Ok(term.read_line()?.trim().to_string())
}

fn confirm(term: &Term, label: &str) -> io::Result<bool> {
    let answer = prompt(term, label)?.to_ascii_lowercase();
    Ok(matches!(answer.as_str(), "y" | "yes" | "s" | "sim"))
}
