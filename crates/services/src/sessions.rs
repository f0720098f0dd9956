//! Serialized access to session revenue state.
//!
//! Every read-modify-write of a session runs under that session's lock, so
//! concurrent credits and bucket debits never interleave.

use std::sync::Arc;

use dashmap::DashMap;
use domains::errors::Result;
use domains::models::SessionContext;
use domains::ports::SessionStore;
use tokio::sync::Mutex;
use tracing::debug;

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    pub async fn load(&self, session_id: &str) -> Result<SessionContext> {
        self.store.load(session_id).await
    }

    /// Loads, mutates and saves one session while holding its lock.
    pub async fn with_session<T: Send>(
        &self,
        session_id: &str,
        update: impl FnOnce(&mut SessionContext) -> T + Send,
    ) -> Result<T> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = async {
            let _guard = lock.lock().await;
            let mut session = self.store.load(session_id).await?;
            session.session_id = session_id.to_string();
            let out = update(&mut session);
            self.store.save(&session).await?;
            Ok(out)
        }
        .await;

        drop(lock);
        self.locks.remove_if(session_id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    /// New funnel entry: unspent bucket revenue does not carry over.
    pub async fn start_path(&self, session_id: &str) -> Result<()> {
        debug!(session = session_id, "revenue bucket reset");
        self.with_session(session_id, |s| s.revenue_bucket = 0.0).await
    }

    pub async fn start_survey(&self, session_id: &str) -> Result<()> {
        self.with_session(session_id, |s| s.soi_revenue = 0.0).await
    }

    pub async fn start_linkouts(&self, session_id: &str) -> Result<()> {
        self.with_session(session_id, |s| s.linkout_revenue = 0.0).await
    }

    /// Delivered lead revenue counts toward the survey total and the bucket.
    pub async fn credit_soi(&self, session_id: &str, amount: f64) -> Result<SessionContext> {
        self.with_session(session_id, |s| {
            s.soi_revenue += amount;
            s.revenue_bucket += amount;
            s.clone()
        })
        .await
    }

    pub async fn credit_linkout(&self, session_id: &str, amount: f64) -> Result<SessionContext> {
        self.with_session(session_id, |s| {
            s.linkout_revenue += amount;
            s.revenue_bucket += amount;
            s.clone()
        })
        .await
    }
}
