use super::secret::{hash_pin, verify_pin, KdfParams};
use super::{AuthError, AuthState, OfflineSession, OfflineUser, Result};
use crate::remote::IdentityProvider;
use crate::store::DurableStore;
use hearth_engine::{Clock, Record, RecordKey, Timestamp, UserId, UserProfile};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const LAST_USER_KEY: &str = "auth.last_user";
const SESSION_KEY: &str = "auth.session";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    user_id: UserId,
    started_at: Timestamp,
}

/// Offline login against the local profile.
///
/// Everything it keeps lives in the durable store, so a session survives a
/// restart. Not safe to call concurrently; [`super::CredentialManager`]
/// serializes access.
pub struct OfflineAuthenticator {
    store: Arc<dyn DurableStore>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    session_ttl: Timestamp,
    kdf: KdfParams,
}

impl std::fmt::Debug for OfflineAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineAuthenticator")
            .field("session_ttl", &self.session_ttl)
            .field("kdf", &self.kdf)
            .finish()
    }
}

impl OfflineAuthenticator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        session_ttl: Duration,
        kdf: KdfParams,
    ) -> Self {
        Self {
            store,
            identity,
            clock,
            session_ttl: session_ttl.as_millis() as Timestamp,
            kdf,
        }
    }

    async fn hash(&self, pin: &str) -> Result<String> {
        let pin = pin.to_string();
        let kdf = self.kdf;
        tokio::task::spawn_blocking(move || hash_pin(&pin, kdf))
            .await
            .map_err(|e| AuthError::Hashing(e.to_string()))?
            .map_err(AuthError::Hashing)
    }

    async fn verify(&self, pin: &str, stored: &str) -> Result<bool> {
        let (pin, stored) = (pin.to_string(), stored.to_string());
        tokio::task::spawn_blocking(move || verify_pin(&pin, &stored))
            .await
            .map_err(|e| AuthError::Hashing(e.to_string()))?
            .map_err(AuthError::Hashing)
    }

    async fn last_user(&self) -> Result<Option<UserId>> {
        Ok(self.store.get_setting(LAST_USER_KEY).await?)
    }

    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(match self.store.get(&RecordKey::profile(user_id)).await? {
            Some(Record::Profile(profile)) => Some(profile),
            _ => None,
        })
    }

    /// The last known user's profile, if offline login is set up for it.
    async fn enrolled_profile(&self) -> Result<Option<(UserProfile, String)>> {
        let Some(user_id) = self.last_user().await? else {
            return Ok(None);
        };
        Ok(self.profile(&user_id).await?.and_then(|profile| {
            let hash = profile.secret_hash.clone()?;
            Some((profile, hash))
        }))
    }

    async fn session(&self) -> Result<Option<StoredSession>> {
        match self.store.get_setting(SESSION_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear_session(&self) -> Result<()> {
        Ok(self.store.remove_setting(SESSION_KEY).await?)
    }

    /// Enable offline login for the user signed in remotely.
    ///
    /// Calling it again replaces the PIN.
    pub async fn enable(&self, user_id: &str, pin: &str) -> Result<OfflineUser> {
        let remote_user = match self.identity.current_user() {
            Some(user) if user.id == user_id => user,
            _ => return Err(AuthError::NotAuthenticated),
        };
        if pin.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        let secret_hash = self.hash(pin).await?;
        let now = self.clock.now();

        let mut profile = match self.profile(user_id).await? {
            Some(profile) => profile,
            None => UserProfile {
                id: remote_user.id.clone(),
                name: remote_user.name.clone(),
                email: remote_user.email.clone(),
                photo_ref: remote_user.photo_ref.clone(),
                created_at: now,
                updated_at: now,
                ..Default::default()
            },
        };
        profile.secret_hash = Some(secret_hash);
        // the hash never reaches the remote, so a clean profile stays clean
        if !profile.dirty {
            profile.last_sync_at = Some(now);
        }

        let user = OfflineUser::from(&profile);
        self.store.upsert(&Record::Profile(profile)).await?;
        self.store.put_setting(LAST_USER_KEY, user_id).await?;

        tracing::info!(user_id, "Offline login enabled");
        Ok(user)
    }

    /// Log in with the PIN and start a session.
    pub async fn login(&self, pin: &str) -> Result<OfflineUser> {
        let Some((profile, hash)) = self.enrolled_profile().await? else {
            return Err(AuthError::NotAvailable);
        };
        if !self.verify(pin, &hash).await? {
            tracing::info!("Offline login rejected");
            return Err(AuthError::InvalidCredential);
        }

        let session = StoredSession {
            user_id: profile.id.clone(),
            started_at: self.clock.now(),
        };
        self.store
            .put_setting(SESSION_KEY, &serde_json::to_string(&session)?)
            .await?;

        tracing::info!(user_id = %profile.id, "Offline session started");
        Ok(OfflineUser::from(&profile))
    }

    /// The current session if it is still valid. An invalid session is
    /// cleared.
    pub async fn check_session(&self) -> Result<OfflineSession> {
        let Some(session) = self.session().await? else {
            return Err(AuthError::NoSession);
        };

        if self.profile(&session.user_id).await?.is_none() {
            self.clear_session().await?;
            return Err(AuthError::NoSession);
        }

        let now = self.clock.now();
        if now.saturating_sub(session.started_at) > self.session_ttl {
            self.clear_session().await?;
            tracing::info!(user_id = %session.user_id, "Offline session expired");
            return Err(AuthError::SessionExpired);
        }

        Ok(OfflineSession {
            expires_at: session.started_at + self.session_ttl,
            user_id: session.user_id,
            started_at: session.started_at,
        })
    }

    /// Replace the PIN after checking the old one.
    pub async fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<()> {
        let Some((mut profile, hash)) = self.enrolled_profile().await? else {
            return Err(AuthError::NotAvailable);
        };
        if !self.verify(old_pin, &hash).await? || new_pin.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        profile.secret_hash = Some(self.hash(new_pin).await?);
        let user_id = profile.id.clone();
        self.store.upsert(&Record::Profile(profile)).await?;

        tracing::info!(user_id = %user_id, "Offline PIN changed");
        Ok(())
    }

    /// Forget the offline credentials and the local data of the last user.
    pub async fn disable(&self) -> Result<()> {
        self.clear_session().await?;
        let Some(user_id) = self.last_user().await? else {
            return Ok(());
        };

        self.store.delete(&RecordKey::profile(user_id.as_str())).await?;
        self.store
            .delete(&RecordKey::preferences(user_id.as_str()))
            .await?;
        self.store.remove_setting(LAST_USER_KEY).await?;

        tracing::info!(user_id = %user_id, "Offline login disabled");
        Ok(())
    }

    /// End the session, keeping the PIN.
    pub async fn end_session(&self) -> Result<()> {
        self.clear_session().await
    }

    pub async fn state(&self) -> Result<AuthState> {
        if self.enrolled_profile().await?.is_none() {
            return Ok(AuthState::Uninitialized);
        }
        let now = self.clock.now();
        Ok(match self.session().await? {
            Some(session) if now.saturating_sub(session.started_at) <= self.session_ttl => {
                AuthState::LoggedIn
            }
            _ => AuthState::LoggedOut,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteUser, StaticIdentity};
    use crate::store::MemoryStore;
    use hearth_engine::clock::DAY;
    use hearth_engine::ManualClock;

    struct Fixture {
        store: Arc<MemoryStore>,
        identity: Arc<StaticIdentity>,
        clock: ManualClock,
        auth: OfflineAuthenticator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(StaticIdentity::new(Some(RemoteUser {
            id: "u1".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            photo_ref: None,
        })));
        let clock = ManualClock::new(1_000_000);
        let auth = OfflineAuthenticator::new(
            store.clone(),
            identity.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(7 * 24 * 3600),
            KdfParams::insecure_fast(),
        );
        Fixture {
            store,
            identity,
            clock,
            auth,
        }
    }

    #[tokio::test]
    async fn enable_seeds_profile_from_identity() {
        let f = fixture();
        let user = f.auth.enable("u1", "1234").await.unwrap();
        assert_eq!(user.name, "Ada");

        let Some(Record::Profile(profile)) =
            f.store.get(&RecordKey::profile("u1")).await.unwrap()
        else {
            panic!("expected profile");
        };
        let hash = profile.secret_hash.unwrap();
        assert_ne!(hash, "1234");
        assert!(!profile.dirty);
        assert_eq!(profile.last_sync_at, Some(1_000_000));
        assert_eq!(f.auth.state().await.unwrap(), AuthState::LoggedOut);
    }

    #[tokio::test]
    async fn enable_requires_matching_remote_session() {
        let f = fixture();
        assert_eq!(
            f.auth.enable("someone-else", "1234").await,
            Err(AuthError::NotAuthenticated)
        );
        f.identity.sign_out();
        assert_eq!(
            f.auth.enable("u1", "1234").await,
            Err(AuthError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn enable_keeps_pending_profile_edits_dirty() {
        let f = fixture();
        f.store
            .upsert(&Record::Profile(UserProfile {
                id: "u1".into(),
                name: "Ada L.".into(),
                dirty: true,
                ..Default::default()
            }))
            .await
            .unwrap();

        f.auth.enable("u1", "1234").await.unwrap();
        let profile = f.store.get(&RecordKey::profile("u1")).await.unwrap().unwrap();
        assert!(profile.is_dirty());
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let f = fixture();
        f.auth.enable("u1", "1234").await.unwrap();
        f.auth.login("1234").await.unwrap();
        assert_eq!(f.auth.state().await.unwrap(), AuthState::LoggedIn);

        f.clock.advance(7 * DAY);
        let session = f.auth.check_session().await.unwrap();
        assert_eq!(session.expires_at, 1_000_000 + 7 * DAY);

        f.clock.advance(1);
        assert_eq!(f.auth.check_session().await, Err(AuthError::SessionExpired));
        assert_eq!(f.auth.check_session().await, Err(AuthError::NoSession));
    }

    #[tokio::test]
    async fn session_without_profile_is_cleared() {
        let f = fixture();
        f.auth.enable("u1", "1234").await.unwrap();
        f.auth.login("1234").await.unwrap();
        f.store.delete(&RecordKey::profile("u1")).await.unwrap();

        assert_eq!(f.auth.check_session().await, Err(AuthError::NoSession));
        assert_eq!(f.store.get_setting(SESSION_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_pins_rejected() {
        let f = fixture();
        assert_eq!(
            f.auth.enable("u1", "").await,
            Err(AuthError::InvalidCredential)
        );
        f.auth.enable("u1", "1234").await.unwrap();
        assert_eq!(
            f.auth.change_pin("1234", "").await,
            Err(AuthError::InvalidCredential)
        );
    }
}
