use crate::auth::Credentials;
use crate::config::SharedConfig;
use crate::engine::Engine;
use crate::feed::DepthFeedHandle;
use crate::orderbook::BookMirror;
use crate::uptime::UptimeTracker;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything the dashboard routes need, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub book: Arc<BookMirror>,
    pub config: SharedConfig,
    pub uptime: Arc<UptimeTracker>,
    pub feed: DepthFeedHandle,
    pub creds: Arc<Credentials>,
    /// Serializes config writes so a symbol-switch barrier never interleaves
    /// with another write.
    pub config_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        engine: Arc<Engine>,
        book: Arc<BookMirror>,
        config: SharedConfig,
        uptime: Arc<UptimeTracker>,
        feed: DepthFeedHandle,
        creds: Arc<Credentials>,
    ) -> Self {
        Self {
            engine,
            book,
            config,
            uptime,
            feed,
            creds,
            config_lock: Arc::new(Mutex::new(())),
        }
    }
}
