use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mockito::Matcher;
use page_mirror::{
    map_url, AssetCategory, AssetFetcher, FetchError, Fetched, FormLogin, Mirror, MirrorError,
    MirrorOptions, MirrorPhase, MirrorTarget, SessionContext, SessionCookie,
};
use tempfile::tempdir;
use url::Url;

const PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <link rel="stylesheet" href="/css/site.css">
    <script src="/js/app.js"></script>
  </head>
  <body>
    <img src="/img/missing.png" alt="gone">
    <a href="/about">About</a>
  </body>
</html>"#;

fn options() -> MirrorOptions {
    MirrorOptions {
        timeout: Duration::from_secs(5),
        ..MirrorOptions::default()
    }
}

/// Href the root document should carry for a mirrored asset.
fn local_href(url: &str) -> String {
    map_url(&Url::parse(url).unwrap()).unwrap().to_string()
}

async fn serve_page(server: &mut mockito::ServerGuard) {
    server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(PAGE)
        .create_async()
        .await;
    server
        .mock("GET", "/css/site.css")
        .with_status(200)
        .with_header("content-type", "text/css")
        .with_body("body { color: red }")
        .create_async()
        .await;
    server
        .mock("GET", "/js/app.js")
        .with_status(200)
        .with_header("content-type", "application/javascript")
        .with_body("console.log('hi')")
        .create_async()
        .await;
    server
        .mock("GET", "/img/missing.png")
        .with_status(404)
        .create_async()
        .await;
}

#[tokio::test]
async fn test_failed_asset_does_not_fail_the_page() {
    let mut server = mockito::Server::new_async().await;
    serve_page(&mut server).await;
    let root = format!("{}/", server.url());

    let out = tempdir().unwrap();
    let target = MirrorTarget::new(&root, out.path().join("site")).unwrap();
    let mirror = Mirror::new(options());
    let summary = mirror.run(&target, None).await.unwrap();

    assert_eq!(summary.total_assets, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].code, "status");
    assert_eq!(summary.by_category.get(&AssetCategory::Style), Some(&1));
    assert_eq!(summary.by_category.get(&AssetCategory::Script), Some(&1));
    assert_eq!(mirror.phase(), MirrorPhase::Done);

    let index = fs::read_to_string(target.output_root.join("index.html")).unwrap();
    let css = local_href(&format!("{}/css/site.css", server.url()));
    let js = local_href(&format!("{}/js/app.js", server.url()));
    assert!(index.contains(&format!(r#"href="{css}""#)));
    assert!(index.contains(&format!(r#"src="{js}""#)));
    assert!(index.contains(&format!(r#"src="{}/img/missing.png""#, server.url())));
    assert!(index.contains(r#"<a href="/about">About</a>"#));

    let saved = fs::read_to_string(target.output_root.join(&css)).unwrap();
    assert_eq!(saved, "body { color: red }");
}

#[tokio::test]
async fn test_root_failure_is_fatal() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/")
        .with_status(500)
        .create_async()
        .await;

    let out = tempdir().unwrap();
    let output_root = out.path().join("site");
    let target = MirrorTarget::new(&format!("{}/", server.url()), &output_root).unwrap();
    let mirror = Mirror::new(MirrorOptions {
        archive: true,
        ..options()
    });

    let err = mirror.run(&target, None).await.unwrap_err();
    assert!(matches!(
        err,
        MirrorError::RootFetch {
            source: FetchError::Status(500),
            ..
        }
    ));
    assert_eq!(mirror.phase(), MirrorPhase::Failed);
    assert!(!output_root.join("index.html").exists());
    assert!(!out.path().join("site.zip").exists());
}

#[tokio::test]
async fn test_unresolvable_root_leaves_only_the_bare_directory() {
    let out = tempdir().unwrap();
    let output_root = out.path().join("site");
    let target = MirrorTarget::new("http://example.invalid/", &output_root).unwrap();
    let mirror = Mirror::new(MirrorOptions {
        archive: true,
        ..options()
    });

    let err = mirror.run(&target, None).await.unwrap_err();
    assert!(matches!(err, MirrorError::RootFetch { .. }));
    assert_eq!(mirror.phase(), MirrorPhase::Failed);
    assert_eq!(fs::read_dir(&output_root).unwrap().count(), 0);
    assert!(!out.path().join("site.zip").exists());
}

#[tokio::test]
async fn test_rerun_produces_identical_tree() {
    let mut server = mockito::Server::new_async().await;
    serve_page(&mut server).await;
    let root = format!("{}/", server.url());

    let out = tempdir().unwrap();
    let target = MirrorTarget::new(&root, out.path().join("site")).unwrap();
    let mirror = Mirror::new(MirrorOptions {
        archive: true,
        ..options()
    });

    let first = mirror.run(&target, None).await.unwrap();
    let first_tree = snapshot(&target.output_root);
    let first_zip = fs::read(first.archive.as_ref().unwrap()).unwrap();

    let second = mirror.run(&target, None).await.unwrap();
    assert_eq!(snapshot(&target.output_root), first_tree);
    assert_eq!(fs::read(second.archive.as_ref().unwrap()).unwrap(), first_zip);
    assert_eq!(second.archive, Some(out.path().join("site.zip")));
}

#[tokio::test]
async fn test_configured_cookies_reach_the_root_host() {
    let mut server = mockito::Server::new_async().await;
    let page = server
        .mock("GET", "/")
        .match_header("cookie", Matcher::Regex("sid=abc".to_string()))
        .with_status(200)
        .with_body("<html><body><p>members only</p></body></html>")
        .create_async()
        .await;

    let out = tempdir().unwrap();
    let target = MirrorTarget::new(&format!("{}/", server.url()), out.path().join("site")).unwrap();
    let mirror = Mirror::new(MirrorOptions {
        cookies: vec![SessionCookie::new("sid", "abc")],
        ..options()
    });

    let summary = mirror.run(&target, None).await.unwrap();
    assert_eq!(summary.total_assets, 0);
    page.assert_async().await;
}

/// Serves a fixed page for the root URL and counts every fetch.
#[derive(Clone, Default)]
struct CountingFetcher {
    root: Option<Url>,
    page: Vec<u8>,
    hits: Arc<Mutex<HashMap<Url, usize>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingFetcher {
    fn new(root: &str, page: impl AsRef<[u8]>) -> Self {
        Self {
            root: Some(Url::parse(root).unwrap()),
            page: page.as_ref().to_vec(),
            ..Self::default()
        }
    }

    fn hits(&self, url: &str) -> usize {
        let url = Url::parse(url).unwrap();
        let count = self.hits.lock().unwrap().get(&url).copied().unwrap_or(0);
        count
    }
}

impl AssetFetcher for CountingFetcher {
    async fn fetch(&self, url: &Url, _session: &SessionContext) -> Result<Fetched, FetchError> {
        *self.hits.lock().unwrap().entry(url.clone()).or_insert(0) += 1;
        if self.root.as_ref() == Some(url) {
            return Ok(Fetched {
                bytes: self.page.clone(),
                content_type: Some("text/html".to_string()),
                final_url: url.clone(),
            });
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(Fetched {
            bytes: url.path().as_bytes().to_vec(),
            content_type: None,
            final_url: url.clone(),
        })
    }
}

fn login() -> FormLogin {
    FormLogin::new("test-agent", Duration::from_secs(5))
}

#[tokio::test]
async fn test_shared_url_is_fetched_once() {
    let page = r#"<html><head><link rel="icon" href="/logo.png"></head><body>
        <img src="/logo.png"><img src="logo.png">
        <div style="background: url('https://example.com/logo.png')"></div>
    </body></html>"#;
    let fetcher = CountingFetcher::new("https://example.com/", page);
    let counter = fetcher.clone();

    let out = tempdir().unwrap();
    let target = MirrorTarget::new("https://example.com/", out.path().join("site")).unwrap();
    let mirror = Mirror::with_parts(options(), fetcher, login());
    let summary = mirror.run(&target, None).await.unwrap();

    assert_eq!(summary.total_assets, 1);
    assert_eq!(counter.hits("https://example.com/logo.png"), 1);
    let index = fs::read_to_string(target.output_root.join("index.html")).unwrap();
    assert_eq!(index.matches("example.com/logo.png").count(), 4);
    assert!(!index.contains(r#"src="/logo.png""#));
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let imgs: String = (0..12)
        .map(|i| format!(r#"<img src="/img/{i}.png">"#))
        .collect();
    let page = format!("<html><body>{imgs}</body></html>");
    let fetcher = CountingFetcher {
        delay: Duration::from_millis(20),
        ..CountingFetcher::new("https://example.com/", &page)
    };
    let counter = fetcher.clone();

    let out = tempdir().unwrap();
    let target = MirrorTarget::new("https://example.com/", out.path().join("site")).unwrap();
    let mirror = Mirror::with_parts(
        MirrorOptions {
            max_concurrent: 3,
            ..options()
        },
        fetcher,
        login(),
    );
    let summary = mirror.run(&target, None).await.unwrap();

    assert_eq!(summary.succeeded, 12);
    let peak = counter.peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak in-flight was {peak}");
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let fetcher = CountingFetcher::new("https://example.com/", "<img src=/a.png>");
    let out = tempdir().unwrap();
    let target = MirrorTarget::new("https://example.com/", out.path().join("site")).unwrap();
    let mirror = Mirror::with_parts(options(), fetcher, login());

    mirror.cancellation_token().cancel();
    let err = mirror.run(&target, None).await.unwrap_err();

    assert!(matches!(err, MirrorError::Cancelled));
    assert!(!target.output_root.join("index.html").exists());
}

#[tokio::test]
async fn test_cancel_during_asset_fetch() {
    let imgs: String = (0..6)
        .map(|i| format!(r#"<img src="/img/{i}.png">"#))
        .collect();
    let fetcher = CountingFetcher {
        delay: Duration::from_secs(30),
        ..CountingFetcher::new("https://example.com/", format!("<body>{imgs}</body>"))
    };
    let counter = fetcher.clone();

    let out = tempdir().unwrap();
    let target = MirrorTarget::new("https://example.com/", out.path().join("site")).unwrap();
    let mirror = Mirror::with_parts(
        MirrorOptions {
            max_concurrent: 2,
            archive: true,
            ..options()
        },
        fetcher,
        login(),
    );

    let mut phases = mirror.subscribe();
    let cancel = mirror.cancellation_token();
    let watcher = tokio::spawn(async move {
        let reached = phases
            .wait_for(|phase| *phase == MirrorPhase::FetchingAssets)
            .await
            .is_ok();
        cancel.cancel();
        reached
    });

    let result = tokio::time::timeout(Duration::from_secs(10), mirror.run(&target, None))
        .await
        .expect("cancelled run should finish promptly");

    assert!(watcher.await.unwrap());
    assert!(matches!(result, Err(MirrorError::Cancelled)));
    assert_eq!(mirror.phase(), MirrorPhase::Failed);
    assert!(counter.hits("https://example.com/img/0.png") <= 1);
    assert!(snapshot(&target.output_root).is_empty());
    assert!(!out.path().join("site.zip").exists());
}

#[tokio::test]
async fn test_non_utf8_page_keeps_its_bytes() {
    let page: &[u8] = b"<html><head><meta charset=\"iso-8859-1\"></head>\
<body><p>caf\xE9</p><img src=\"/a.png\"></body></html>";
    let fetcher = CountingFetcher::new("https://example.com/", page);

    let out = tempdir().unwrap();
    let target = MirrorTarget::new("https://example.com/", out.path().join("site")).unwrap();
    let mirror = Mirror::with_parts(options(), fetcher, login());
    let summary = mirror.run(&target, None).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let written = fs::read(target.output_root.join("index.html")).unwrap();
    let expected: &[u8] = b"<html><head><meta charset=\"iso-8859-1\"></head>\
<body><p>caf\xE9</p><img src=\"example.com/a.png\"></body></html>";
    assert_eq!(written, expected);
}

#[tokio::test]
async fn test_base_href_assets_load_locally() {
    let page = r#"<html><head><base href="https://cdn.example.net/static/"></head><body><img src="a.png"></body></html>"#;
    let fetcher = CountingFetcher::new("https://example.com/blog/post.html", page);
    let counter = fetcher.clone();

    let out = tempdir().unwrap();
    let target =
        MirrorTarget::new("https://example.com/blog/post.html", out.path().join("site")).unwrap();
    let mirror = Mirror::with_parts(options(), fetcher, login());
    mirror.run(&target, None).await.unwrap();

    assert_eq!(counter.hits("https://cdn.example.net/static/a.png"), 1);
    assert_eq!(counter.hits("https://example.com/blog/a.png"), 0);
    let index = fs::read_to_string(target.output_root.join("index.html")).unwrap();
    assert!(!index.contains("https://cdn.example.net/static/"));
    assert!(index.contains(r#"<img src="cdn.example.net/static/a.png">"#));
    assert!(target
        .output_root
        .join("cdn.example.net/static/a.png")
        .exists());
}

fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = jwalk::WalkDir::new(root)
        .sort(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let path = e.path();
            let name = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            (name, fs::read(&path).unwrap())
        })
        .collect();
    files.sort();
    files
}
