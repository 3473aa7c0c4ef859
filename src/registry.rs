use redis::aio::MultiplexedConnection;
use redis::aio::PubSub;
use redis::AsyncCommands;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Error;

/// A member disappears from the live set once its heartbeat is older than
/// this, covering crashed processes that never deregistered.
const STALE_THRESHOLD_SECS: u64 = 30;

/// Membership event published on the chroot channel.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub struct MemberEvent {
    pub event: String, // "join" or "leave"
    pub member_id: String,
    pub session: String,
}

/// Redis-backed member registry under a chroot key prefix.
///
/// Liveness markers are entries in a sorted set scored by heartbeat
/// timestamp, so a marker is effectively ephemeral: it only counts as live
/// while its owner keeps heartbeating. A companion hash maps member id to a
/// per-process session id, which is how a reconnecting process is told apart
/// from a second process misconfigured with the same id.
#[derive(Clone)]
pub struct MemberRegistry {
    client: redis::Client,
    conn: MultiplexedConnection,
    chroot: String,
    member_id: String,
    session: String,
}

impl MemberRegistry {
    pub async fn connect(
        redis_url: &str,
        chroot: &str,
        my_id: u32,
        session: uuid::Uuid,
    ) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            client,
            conn,
            chroot: chroot.to_string(),
            member_id: my_id.to_string(),
            session: session.to_string(),
        })
    }

    /// Create the liveness marker for the local node.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` if a fresh marker for this id exists under a
    /// different session. Our own marker from a previous connection of the
    /// same process is taken over silently.
    pub async fn register(&mut self) -> Result<(), Error> {
        let members_key = self.members_key();
        let sessions_key = self.sessions_key();

        let score: Option<f64> = self.conn.zscore(&members_key, &self.member_id).await?;
        if let Some(ts) = score {
            let cutoff = (current_timestamp_ms() - STALE_THRESHOLD_SECS * 1000) as f64;
            let owner: Option<String> = self.conn.hget(&sessions_key, &self.member_id).await?;
            if ts >= cutoff && owner.as_deref() != Some(self.session.as_str()) {
                return Err(Error::DuplicateRegistration(format!(
                    "backend-{}",
                    self.member_id
                )));
            }
        }

        let timestamp = current_timestamp_ms();
        self.conn
            .zadd::<_, _, _, ()>(&members_key, &self.member_id, timestamp)
            .await?;
        self.conn
            .hset::<_, _, _, ()>(&sessions_key, &self.member_id, &self.session)
            .await?;
        self.publish("join").await?;

        tracing::info!(member_id = %self.member_id, session = %self.session, "registered member");
        Ok(())
    }

    pub async fn deregister(&mut self) -> Result<(), Error> {
        let members_key = self.members_key();
        let sessions_key = self.sessions_key();

        self.conn
            .zrem::<_, _, ()>(&members_key, &self.member_id)
            .await?;
        self.conn
            .hdel::<_, _, ()>(&sessions_key, &self.member_id)
            .await?;
        self.publish("leave").await?;

        tracing::info!(member_id = %self.member_id, "deregistered member");
        Ok(())
    }

    /// Refresh the liveness marker's heartbeat timestamp.
    pub async fn heartbeat(&mut self) -> Result<(), Error> {
        let timestamp = current_timestamp_ms();
        self.conn
            .zadd::<_, _, _, ()>(self.members_key(), &self.member_id, timestamp)
            .await?;
        Ok(())
    }

    /// Current live member ids (heartbeat within the stale threshold).
    pub async fn live_members(&mut self) -> Result<Vec<String>, Error> {
        let cutoff = current_timestamp_ms() - STALE_THRESHOLD_SECS * 1000;
        let members: Vec<String> = self
            .conn
            .zrangebyscore(self.members_key(), cutoff, "+inf")
            .await?;
        Ok(members)
    }

    /// Drop markers whose heartbeat went stale without a deregistration.
    pub async fn cleanup_stale(&mut self) -> Result<u64, Error> {
        let members_key = self.members_key();
        let cutoff = current_timestamp_ms() - STALE_THRESHOLD_SECS * 1000;

        let stale: Vec<String> = self
            .conn
            .zrangebyscore(&members_key, "-inf", cutoff)
            .await?;
        if !stale.is_empty() {
            self.conn.zrem::<_, _, ()>(&members_key, &stale).await?;
            self.conn
                .hdel::<_, _, ()>(self.sessions_key(), &stale)
                .await?;
            tracing::info!(count = stale.len(), "cleaned up stale members");
        }
        Ok(stale.len() as u64)
    }

    /// Open a pub/sub subscription on the membership channel. Each received
    /// message signals that the child list changed and should be re-listed.
    pub async fn subscribe(&self) -> Result<PubSub, Error> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel()).await?;
        Ok(pubsub)
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn channel(&self) -> String {
        format!("{}:membership", self.chroot)
    }

    fn members_key(&self) -> String {
        format!("{}:members", self.chroot)
    }

    fn sessions_key(&self) -> String {
        format!("{}:sessions", self.chroot)
    }

    async fn publish(&mut self, event: &str) -> Result<(), Error> {
        let payload = serde_json::to_string(&MemberEvent {
            event: event.to_string(),
            member_id: self.member_id.clone(),
            session: self.session.clone(),
        })
        .map_err(|e| Error::Config(e.to_string()))?;

        redis::cmd("PUBLISH")
            .arg(self.channel())
            .arg(&payload)
            .query_async::<()>(&mut self.conn)
            .await?;
        Ok(())
    }
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use uuid::Uuid;

    fn get_redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
    }

    fn test_chroot() -> String {
        format!("test:{}", Uuid::new_v4())
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_register_then_listed_live() {
        let url = get_redis_url();
        let chroot = test_chroot();
        let mut registry = MemberRegistry::connect(&url, &chroot, 1, Uuid::new_v4())
            .await
            .unwrap();

        registry.register().await.unwrap();
        let members = registry.live_members().await.unwrap();
        assert!(members.contains(&"1".to_string()));

        registry.deregister().await.unwrap();
        let members = registry.live_members().await.unwrap();
        assert!(!members.contains(&"1".to_string()));
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_duplicate_registration_rejected() {
        let url = get_redis_url();
        let chroot = test_chroot();

        let mut first = MemberRegistry::connect(&url, &chroot, 2, Uuid::new_v4())
            .await
            .unwrap();
        first.register().await.unwrap();

        let mut second = MemberRegistry::connect(&url, &chroot, 2, Uuid::new_v4())
            .await
            .unwrap();
        let err = second.register().await.unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(_)));

        first.deregister().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_same_session_may_reregister() {
        let url = get_redis_url();
        let chroot = test_chroot();
        let session = Uuid::new_v4();

        let mut registry = MemberRegistry::connect(&url, &chroot, 3, session).await.unwrap();
        registry.register().await.unwrap();

        // Same process reconnecting after a dropped connection.
        let mut again = MemberRegistry::connect(&url, &chroot, 3, session).await.unwrap();
        again.register().await.unwrap();

        again.deregister().await.unwrap();
    }
}
