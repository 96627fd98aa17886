use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::CatalogueSettings;
use crate::error::SipError;

/// Opaque catalogue session credential with client-side expiry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    key: String,
    issued_at: Instant,
    expires_at: Instant,
}

impl SessionToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Issues new session keys. Implemented by the HTTP login endpoint.
pub trait SessionAuthority: Send + Sync {
    /// Returns a new session key, or `Authentication` when the credentials
    /// are rejected.
    fn login(&self) -> Result<String, SipError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    /// The catalogue drops sessions that stay unused for this long.
    pub idle_timeout: Duration,
    /// Tokens with less validity than this are renewed before use.
    pub renewal_margin: Duration,
}

impl SessionPolicy {
    pub fn from_settings(settings: &CatalogueSettings) -> Self {
        Self {
            idle_timeout: settings.session_idle_timeout,
            renewal_margin: settings.renewal_margin,
        }
    }
}

/// Owns the one session shared by every request in the process.
///
/// Renewal happens while holding the token lock, so callers that find the
/// token close to expiry queue behind a single login instead of each issuing
/// their own. Requests that already hold a token clone never wait for it.
///
/// The catalogue answers both "bad credentials" and "expired session" with
/// the same status. A rejected request is therefore interpreted through the
/// token's history: a token issued by the same call means the account
/// itself was refused, a reused token means the session lapsed server-side
/// and one fresh attempt is made.
pub struct SessionManager<A: SessionAuthority> {
    authority: A,
    policy: SessionPolicy,
    current: Mutex<Option<SessionToken>>,
}

impl<A: SessionAuthority> SessionManager<A> {
    pub fn new(authority: A, policy: SessionPolicy) -> Self {
        Self {
            authority,
            policy,
            current: Mutex::new(None),
        }
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    pub fn acquire(&self) -> Result<SessionToken, SipError> {
        self.acquire_tracked().map(|(token, _)| token)
    }

    /// Runs `request` with a valid token, sliding the session's expiry on
    /// success.
    ///
    /// `request` reports a session rejection as `SessionExpired`.
    pub fn execute<T, F>(&self, mut request: F) -> Result<T, SipError>
    where
        F: FnMut(&SessionToken) -> Result<T, SipError>,
    {
        let (token, issued_now) = self.acquire_tracked()?;
        match request(&token) {
            Ok(value) => {
                self.touch(&token);
                Ok(value)
            }
            Err(SipError::SessionExpired(message)) => {
                self.invalidate(&token);
                if issued_now {
                    return Err(SipError::Authentication(message));
                }
                warn!(%message, "catalogue rejected a reused session; renewing once");
                let (retry_token, retry_issued_now) = self.acquire_tracked()?;
                match request(&retry_token) {
                    Ok(value) => {
                        self.touch(&retry_token);
                        Ok(value)
                    }
                    Err(SipError::SessionExpired(message)) => {
                        self.invalidate(&retry_token);
                        if retry_issued_now {
                            Err(SipError::Authentication(message))
                        } else {
                            Err(SipError::SessionExpired(message))
                        }
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Drops the token if it is still the current one.
    pub fn invalidate(&self, token: &SessionToken) {
        let Ok(mut guard) = self.lock() else {
            return;
        };
        if guard.as_ref().map(|current| current.key == token.key) == Some(true) {
            debug!("invalidating catalogue session");
            *guard = None;
        }
    }

    fn touch(&self, token: &SessionToken) {
        let Ok(mut guard) = self.lock() else {
            return;
        };
        if let Some(current) = guard.as_mut() {
            if current.key == token.key {
                current.expires_at = Instant::now() + self.policy.idle_timeout;
            }
        }
    }

    fn acquire_tracked(&self) -> Result<(SessionToken, bool), SipError> {
        let mut guard = self.lock()?;
        let now = Instant::now();
        if let Some(token) = guard.as_ref() {
            if token.remaining(now) > self.policy.renewal_margin {
                return Ok((token.clone(), false));
            }
            debug!(
                remaining_ms = token.remaining(now).as_millis() as u64,
                "catalogue session close to expiry"
            );
        }

        let started = Instant::now();
        let key = self.authority.login()?;
        let issued_at = Instant::now();
        let token = SessionToken {
            key,
            issued_at,
            expires_at: issued_at + self.policy.idle_timeout,
        };
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "issued catalogue session"
        );
        *guard = Some(token.clone());
        Ok((token, true))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<SessionToken>>, SipError> {
        self.current
            .lock()
            .map_err(|_| SipError::Internal("session state lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Default)]
    struct CountingAuthority {
        logins: AtomicUsize,
        delay: Duration,
        reject: bool,
    }

    impl SessionAuthority for CountingAuthority {
        fn login(&self) -> Result<String, SipError> {
            if self.reject {
                return Err(SipError::Authentication("401 Unauthorized".to_string()));
            }
            thread::sleep(self.delay);
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("key-{n}"))
        }
    }

    fn policy(idle_ms: u64, margin_ms: u64) -> SessionPolicy {
        SessionPolicy {
            idle_timeout: Duration::from_millis(idle_ms),
            renewal_margin: Duration::from_millis(margin_ms),
        }
    }

    #[test]
    fn reuses_valid_token() {
        let manager = SessionManager::new(CountingAuthority::default(), policy(60_000, 1_000));
        let first = manager.acquire().unwrap();
        let second = manager.acquire().unwrap();
        assert_eq!(first.key(), second.key());
        assert_eq!(manager.authority().logins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn renews_inside_safety_margin() {
        let manager = SessionManager::new(CountingAuthority::default(), policy(60_000, 59_800));
        let first = manager.acquire().unwrap();
        thread::sleep(Duration::from_millis(300));
        let second = manager.acquire().unwrap();
        assert_ne!(first.key(), second.key());
        assert_eq!(manager.authority().logins.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_callers_share_one_renewal() {
        let authority = CountingAuthority {
            delay: Duration::from_millis(50),
            ..CountingAuthority::default()
        };
        let manager = Arc::new(SessionManager::new(authority, policy(60_000, 59_500)));
        manager.acquire().unwrap();
        thread::sleep(Duration::from_millis(600));

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.acquire().unwrap().key().to_string()
                })
            })
            .collect();
        let keys: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(manager.authority().logins.load(Ordering::SeqCst), 2);
        assert!(keys.iter().all(|key| key == "key-2"));
    }

    #[test]
    fn rejected_login_is_authentication_error() {
        let authority = CountingAuthority {
            reject: true,
            ..CountingAuthority::default()
        };
        let manager = SessionManager::new(authority, policy(60_000, 1_000));
        assert_matches!(manager.acquire(), Err(SipError::Authentication(_)));
    }

    #[test]
    fn rejection_of_fresh_token_is_authentication_error() {
        let manager = SessionManager::new(CountingAuthority::default(), policy(60_000, 1_000));
        let result: Result<(), SipError> =
            manager.execute(|_| Err(SipError::SessionExpired("403".to_string())));
        assert_matches!(result, Err(SipError::Authentication(_)));
    }

    #[test]
    fn rejection_of_reused_token_renews_once() {
        let manager = SessionManager::new(CountingAuthority::default(), policy(60_000, 1_000));
        manager.acquire().unwrap();

        let mut attempts = 0;
        let result = manager.execute(|token| {
            attempts += 1;
            if token.key() == "key-1" {
                Err(SipError::SessionExpired("403".to_string()))
            } else {
                Ok(token.key().to_string())
            }
        });
        assert_eq!(result.unwrap(), "key-2");
        assert_eq!(attempts, 2);
    }

    #[test]
    fn successful_request_slides_expiry() {
        let manager = SessionManager::new(CountingAuthority::default(), policy(60_000, 1_000));
        let before = manager.acquire().unwrap();
        thread::sleep(Duration::from_millis(20));
        manager.execute(|_| Ok(())).unwrap();
        let after = manager.acquire().unwrap();
        assert_eq!(before.key(), after.key());
        assert!(after.expires_at() > before.expires_at());
    }

    #[test]
    fn poisoned_state_is_a_terminal_internal_error() {
        let manager = Arc::new(SessionManager::new(
            CountingAuthority::default(),
            policy(60_000, 1_000),
        ));
        let holder = Arc::clone(&manager);
        let crashed = thread::spawn(move || {
            let _guard = holder.current.lock().unwrap();
            panic!("worker crashed while holding the session");
        })
        .join();
        assert!(crashed.is_err());

        let err = manager.acquire().unwrap_err();
        assert_matches!(err, SipError::Internal(_));
        assert!(err.outcome().is_terminal());
        assert_eq!(err.category(), "InternalError");
    }
}
