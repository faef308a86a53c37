//! Cookie-keyed session store.
//!
//! A session is created on the first lookup that carries no live session
//! cookie and is refreshed by every later lookup. Each session has one
//! scheduled wake-up at its deadline; every lookup also sweeps sessions whose
//! deadline has passed, so expiry does not depend on the timer firing first.
//!
//! Responses that looked a session up stay bound to it until they start.
//! When the session expires, each bound response that has not started yet
//! gets a cookie that clears the session on the client.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::sink::SharedHeaders;

/// Session store settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cookie carrying the session id. Default: `bridge_session`.
    pub cookie_name: String,
    /// Idle lifetime, renewed on every lookup. Default: 30 minutes.
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "bridge_session".to_string(),
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

struct SessionEntry {
    data: Map<String, Value>,
    expires_at: Instant,
    bound: Vec<SharedHeaders>,
    timer: Option<AbortHandle>,
}

impl SessionEntry {
    fn bind(&mut self, response: &SharedHeaders) {
        self.bound.retain(|bound| !bound.is_frozen());
        if !self.bound.iter().any(|bound| bound.same_response(response)) {
            self.bound.push(response.clone());
        }
    }
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Shared store of live sessions.
pub struct SessionStore {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find or create the session for a request and bind `response` to it.
    ///
    /// A new session appends its `Set-Cookie` header to `response`. Must be
    /// called from within a tokio runtime.
    pub fn lookup(
        self: &Arc<Self>,
        request_headers: &[(String, String)],
        response: &SharedHeaders,
    ) -> Session {
        let now = Instant::now();
        let mut sessions = self.lock();
        self.sweep(&mut sessions, now);

        let deadline = now + self.config.ttl;
        let cookie = session_cookie(request_headers, &self.config.cookie_name);
        if let Some(entry) = cookie.and_then(|id| sessions.get_mut(id).map(|entry| (id, entry))) {
            let (id, entry) = entry;
            entry.expires_at = deadline;
            entry.bind(response);
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.timer = Some(self.schedule(id.to_string(), deadline));
            debug!(session = id, "session refreshed");
            return Session {
                id: id.to_string(),
                store: Arc::clone(self),
            };
        }

        let id = new_session_id();
        let mut entry = SessionEntry {
            data: Map::new(),
            expires_at: deadline,
            bound: Vec::new(),
            timer: Some(self.schedule(id.clone(), deadline)),
        };
        entry.bind(response);
        response.append(
            "set-cookie",
            format!("{}={id}; Path=/; HttpOnly", self.config.cookie_name),
        );
        sessions.insert(id.clone(), entry);
        debug!(session = %id, "session created");
        Session {
            id,
            store: Arc::clone(self),
        }
    }

    /// Expire every session whose deadline has passed.
    pub fn sweep_expired(&self) {
        let mut sessions = self.lock();
        self.sweep(&mut sessions, Instant::now());
    }

    fn sweep(&self, sessions: &mut HashMap<String, SessionEntry>, now: Instant) {
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = sessions.remove(&id) {
                self.expire(&id, entry);
            }
        }
    }

    fn expire(&self, id: &str, mut entry: SessionEntry) {
        entry.data.clear();
        let cookie = format!("{}=; Path=/; Max-Age=0; HttpOnly", self.config.cookie_name);
        let mut notified = 0usize;
        for response in entry.bound.drain(..) {
            if response.append("set-cookie", cookie.clone()) {
                notified += 1;
            }
        }
        debug!(session = id, notified, "session expired");
    }

    fn expire_if_due(&self, id: &str) {
        let mut sessions = self.lock();
        let due = sessions
            .get(id)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if !due {
            return;
        }
        if let Some(mut entry) = sessions.remove(id) {
            // Running on the timer task itself.
            entry.timer = None;
            self.expire(id, entry);
        }
    }

    fn schedule(self: &Arc<Self>, id: String, deadline: Instant) -> AbortHandle {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(store) = store.upgrade() {
                store.expire_if_due(&id);
            }
        })
        .abort_handle()
    }

    fn with_entry<R>(&self, id: &str, f: impl FnOnce(&mut SessionEntry) -> R) -> Option<R> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(id)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(f(entry))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("config", &self.config)
            .field("sessions", &self.len())
            .finish()
    }
}

/// Handle to one session. Reads and writes go to the store, so a handle of
/// an expired session sees no data and drops writes.
#[derive(Clone)]
pub struct Session {
    id: String,
    store: Arc<SessionStore>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store
            .with_entry(&self.id, |entry| entry.data.get(key).cloned())
            .flatten()
    }

    /// Store a value. Returns `false` if the session has expired.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        self.store
            .with_entry(&self.id, |entry| {
                entry.data.insert(key, value);
            })
            .is_some()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.store
            .with_entry(&self.id, |entry| entry.data.remove(key))
            .flatten()
    }

    /// Snapshot of all values.
    pub fn data(&self) -> Map<String, Value> {
        self.store
            .with_entry(&self.id, |entry| entry.data.clone())
            .unwrap_or_default()
    }

    pub fn is_live(&self) -> bool {
        self.store.with_entry(&self.id, |_| ()).is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

fn session_cookie<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .filter(|(header, _)| header.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

fn new_session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    let mut id = String::with_capacity(32);
    for byte in bytes {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cookie_for(session: &Session) -> Vec<(String, String)> {
        vec![(
            "Cookie".to_string(),
            format!("theme=dark; bridge_session={}", session.id()),
        )]
    }

    fn set_cookies(headers: &SharedHeaders) -> Vec<String> {
        headers
            .snapshot()
            .into_iter()
            .filter(|(name, _)| name == "set-cookie")
            .map(|(_, value)| value)
            .collect()
    }

    #[test]
    fn cookie_parsing_finds_named_value() {
        let headers = vec![
            ("accept".to_string(), "*/*".to_string()),
            ("cookie".to_string(), "a=1; bridge_session=abc ; b=2".to_string()),
        ];
        assert_eq!(session_cookie(&headers, "bridge_session"), Some("abc"));
        assert_eq!(session_cookie(&headers, "missing"), None);
    }

    #[test]
    fn session_ids_are_hex_and_distinct() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn miss_creates_session_and_sets_cookie() {
        let store = SessionStore::new(SessionConfig::default());
        let response = SharedHeaders::new();
        let session = store.lookup(&[], &response);

        assert_eq!(store.len(), 1);
        assert_eq!(
            set_cookies(&response),
            vec![format!("bridge_session={}; Path=/; HttpOnly", session.id())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hit_returns_same_session_without_new_cookie() {
        let store = SessionStore::new(SessionConfig::default());
        let first = store.lookup(&[], &SharedHeaders::new());
        assert!(first.insert("user", json!("ada")));

        let response = SharedHeaders::new();
        let again = store.lookup(&cookie_for(&first), &response);
        assert_eq!(again.id(), first.id());
        assert_eq!(again.get("user"), Some(json!("ada")));
        assert!(set_cookies(&response).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_refreshes_deadline() {
        let store = SessionStore::new(SessionConfig {
            ttl: Duration::from_secs(10),
            ..SessionConfig::default()
        });
        let session = store.lookup(&[], &SharedHeaders::new());

        tokio::time::sleep(Duration::from_secs(7)).await;
        store.lookup(&cookie_for(&session), &SharedHeaders::new());
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(session.is_live());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!session.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expiry_clears_data_and_notifies_open_responses() {
        let store = SessionStore::new(SessionConfig {
            ttl: Duration::from_secs(5),
            ..SessionConfig::default()
        });
        let response = SharedHeaders::new();
        let session = store.lookup(&[], &response);
        session.insert("k", json!(1));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty());
        assert_eq!(session.get("k"), None);
        assert!(!session.insert("k", json!(2)));
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1], "bridge_session=; Path=/; Max-Age=0; HttpOnly");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cookie_starts_a_fresh_session() {
        let store = SessionStore::new(SessionConfig {
            ttl: Duration::from_secs(1),
            ..SessionConfig::default()
        });
        let old = store.lookup(&[], &SharedHeaders::new());
        tokio::time::sleep(Duration::from_secs(2)).await;

        let response = SharedHeaders::new();
        let fresh = store.lookup(&cookie_for(&old), &response);
        assert_ne!(fresh.id(), old.id());
        assert_eq!(store.len(), 1);
        assert_eq!(set_cookies(&response).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_without_waiting_for_timer() {
        let store = SessionStore::new(SessionConfig {
            ttl: Duration::from_secs(1),
            ..SessionConfig::default()
        });
        store.lookup(&[], &SharedHeaders::new());
        tokio::time::advance(Duration::from_secs(2)).await;
        store.sweep_expired();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_store_cancels_timers() {
        let store = SessionStore::new(SessionConfig {
            ttl: Duration::from_secs(1),
            ..SessionConfig::default()
        });
        let weak = Arc::downgrade(&store);
        let session = store.lookup(&[], &SharedHeaders::new());
        drop(session);
        drop(store);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(weak.upgrade().is_none());
    }
}
