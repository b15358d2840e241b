//! End-to-end checks of `ProductScraper` against a scripted browser engine.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use product_scraper_rs::modules::cache_key;
use product_scraper_rs::{
    BlockReason, CacheError, CacheStore, DelayRange, FailureClass, Identity, IdentityDescriptor,
    ListenerId, MemoryCache, NavigateOptions, ObservedResponse, ProductScraper, ResponseListener,
    ScrapeError, ScraperConfig, Session, SessionEngine, SessionError,
};
use url::Url;

const PRODUCT_URL: &str = "https://shop.example/product/7/42";

#[derive(Clone, Copy)]
enum Script {
    Serve,
    Captcha,
}

#[derive(Default)]
struct EngineLog {
    sessions: AtomicUsize,
    closes: AtomicUsize,
    proxies: Mutex<Vec<Option<String>>>,
}

struct ScriptedEngine {
    script: Script,
    log: Arc<EngineLog>,
}

impl ScriptedEngine {
    fn new(script: Script) -> (Arc<Self>, Arc<EngineLog>) {
        let log = Arc::new(EngineLog::default());
        (
            Arc::new(Self {
                script,
                log: log.clone(),
            }),
            log,
        )
    }
}

#[async_trait]
impl SessionEngine for ScriptedEngine {
    async fn create_session(
        &self,
        identity: Option<&Identity>,
        _descriptor: &IdentityDescriptor,
    ) -> Result<Box<dyn Session>, SessionError> {
        self.log.sessions.fetch_add(1, Ordering::SeqCst);
        self.log
            .proxies
            .lock()
            .unwrap()
            .push(identity.map(Identity::endpoint));
        Ok(Box::new(ScriptedPage {
            script: self.script,
            log: self.log.clone(),
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(0),
        }))
    }
}

struct ScriptedPage {
    script: Script,
    log: Arc<EngineLog>,
    listeners: Mutex<BTreeMap<ListenerId, ResponseListener>>,
    next_id: AtomicUsize,
}

impl ScriptedPage {
    fn emit(&self, url: &str, status: u16, body: &'static str) {
        let response = ObservedResponse {
            url: Url::parse(url).unwrap(),
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        };
        let listeners: Vec<_> = self.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            listener(&response);
        }
    }
}

#[async_trait]
impl Session for ScriptedPage {
    async fn navigate(&self, _url: &Url, _options: &NavigateOptions) -> Result<(), SessionError> {
        match self.script {
            Script::Serve => {
                self.emit(
                    "https://shop.example/api/v4/pdp/get_pc?itemid=42&shopid=7",
                    200,
                    r#"{"data":{"name":"Kettle","price":1999}}"#,
                );
                self.emit(
                    "https://shop.example/api/v4/pdp/get_benefits?itemid=42&shopid=7",
                    200,
                    r#"{"data":{"vouchers":[]}}"#,
                );
            }
            Script::Captcha => {
                self.emit("https://shop.example/verify/captcha?anti_bot_tracking_id=1", 200, "");
            }
        }
        Ok(())
    }

    fn on_response(&self, listener: ResponseListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as ListenerId;
        self.listeners.lock().unwrap().insert(id, listener);
        id
    }

    fn off_response(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(&id);
    }

    async fn move_pointer(&self, _x: f64, _y: f64) -> Result<(), SessionError> {
        Ok(())
    }

    async fn scroll_height(&self) -> Result<u64, SessionError> {
        Ok(200)
    }

    async fn scroll_by(&self, _pixels: u64) -> Result<(), SessionError> {
        Ok(())
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<(), SessionError> {
        Ok(())
    }

    async fn screenshot(&self, _path: &Path) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Accepts reads, fails every write.
struct ReadOnlyCache;

#[async_trait]
impl CacheStore for ReadOnlyCache {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(None)
    }

    async fn set_with_ttl(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        Err(CacheError::Serialization(err))
    }
}

fn quiet_config() -> ScraperConfig {
    let mut config = ScraperConfig::default();
    config.pre_request_delay = DelayRange::ZERO;
    config.session.pre_navigation_delay = DelayRange::ZERO;
    config.session.post_capture_delay = DelayRange::ZERO;
    config.session.scroll.interval = DelayRange::ZERO;
    config.session.screenshot_dir = None;
    config.retry.jitter = 0.0;
    config
}

#[tokio::test(start_paused = true)]
async fn second_fetch_is_served_from_cache() {
    let (engine, log) = ScriptedEngine::new(Script::Serve);
    let scraper = ProductScraper::builder()
        .with_config(quiet_config())
        .with_engine(engine)
        .build()
        .unwrap();

    let first = scraper.fetch(PRODUCT_URL).await.unwrap();
    assert!(!first.metadata.cached);
    assert_eq!(first.product_detail["data"]["name"], "Kettle");

    let second = scraper
        .fetch("https://shop.example/product/7/42/?utm_source=newsletter")
        .await
        .unwrap();
    assert!(second.metadata.cached);
    assert_eq!(second.product_detail, first.product_detail);
    assert_eq!(second.metadata.scraped_at, first.metadata.scraped_at);

    assert_eq!(log.sessions.load(Ordering::SeqCst), 1);
    assert_eq!(log.closes.load(Ordering::SeqCst), 1);

    let summary = scraper.metrics_summary(60);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.successes, 2);
    assert_eq!(summary.cache_hits, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_blocking_surfaces_block_reason() {
    let (engine, log) = ScriptedEngine::new(Script::Captcha);
    let scraper = ProductScraper::builder()
        .with_config(quiet_config())
        .with_proxies(["http://10.0.0.1:3128", "http://10.0.0.2:3128", "http://10.0.0.3:3128"])
        .with_engine(engine)
        .build()
        .unwrap();

    let err = scraper.fetch(PRODUCT_URL).await.unwrap_err();
    assert_eq!(err.classification(), FailureClass::Blocked(BlockReason::Captcha));
    assert_eq!(err.attempts(), 3);

    assert_eq!(log.sessions.load(Ordering::SeqCst), 3);
    assert_eq!(log.closes.load(Ordering::SeqCst), 3);
    let proxies: HashSet<_> = log
        .proxies
        .lock()
        .unwrap()
        .iter()
        .map(|proxy| proxy.clone().unwrap())
        .collect();
    assert_eq!(proxies.len(), 3);

    let health = scraper.proxy_health();
    assert_eq!(health.total_proxies, 3);
    assert_eq!(health.cooling_down, 3);

    let top = scraper.top_errors(5);
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].error, "captcha");
    assert_eq!(scraper.metrics_summary(60).failures, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_not_cached() {
    let (engine, log) = ScriptedEngine::new(Script::Captcha);
    let mut config = quiet_config();
    config.retry.max_attempts = 1;
    let scraper = ProductScraper::builder()
        .with_config(config)
        .with_engine(engine)
        .build()
        .unwrap();

    assert!(scraper.fetch(PRODUCT_URL).await.is_err());
    assert!(scraper.fetch(PRODUCT_URL).await.is_err());
    assert_eq!(log.sessions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn corrupt_cache_entry_is_refetched() {
    let (engine, log) = ScriptedEngine::new(Script::Serve);
    let cache = Arc::new(MemoryCache::new());
    let config = quiet_config();
    let key = cache_key(&config.cache.key_prefix, &Url::parse(PRODUCT_URL).unwrap());
    cache
        .set_with_ttl(&key, Bytes::from_static(b"not json"), Duration::from_secs(60))
        .await
        .unwrap();

    let scraper = ProductScraper::builder()
        .with_config(config)
        .with_cache(cache.clone())
        .with_engine(engine)
        .build()
        .unwrap();

    let result = scraper.fetch(PRODUCT_URL).await.unwrap();
    assert!(!result.metadata.cached);
    assert_eq!(log.sessions.load(Ordering::SeqCst), 1);
    assert!(scraper.fetch(PRODUCT_URL).await.unwrap().metadata.cached);
}

#[tokio::test(start_paused = true)]
async fn cache_write_failure_does_not_fail_fetch() {
    let (engine, _) = ScriptedEngine::new(Script::Serve);
    let scraper = ProductScraper::builder()
        .with_config(quiet_config())
        .with_cache(Arc::new(ReadOnlyCache))
        .with_engine(engine)
        .build()
        .unwrap();

    let result = scraper.fetch(PRODUCT_URL).await.unwrap();
    assert_eq!(result.benefits["data"]["vouchers"], serde_json::json!([]));
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_new_fetches() {
    let (engine, log) = ScriptedEngine::new(Script::Serve);
    let scraper = ProductScraper::builder()
        .with_config(quiet_config())
        .with_engine(engine)
        .build()
        .unwrap();

    scraper.shutdown();
    let err = scraper.fetch(PRODUCT_URL).await.unwrap_err();
    assert!(matches!(err, ScrapeError::Shutdown));
    assert_eq!(log.sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_url_is_rejected_up_front() {
    let (engine, log) = ScriptedEngine::new(Script::Serve);
    let scraper = ProductScraper::builder()
        .with_config(quiet_config())
        .with_engine(engine)
        .build()
        .unwrap();

    let err = scraper.fetch("not a product url").await.unwrap_err();
    assert_eq!(err.classification(), FailureClass::InvalidInput);
    assert_eq!(log.sessions.load(Ordering::SeqCst), 0);
}
