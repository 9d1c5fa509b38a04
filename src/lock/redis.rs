use crate::store::{AcquiredLock, NamedLock};
use anyhow::Result;
use uuid::Uuid;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

// Release only deletes the key when the token still matches, so an expired
// lock reacquired by someone else is never removed.
#[derive(Clone)]
pub struct RedisLock {
    pub client: redis::Client,
    pub ttl_ms: u64,
    pub wait_ms: u64,
    pub poll_ms: u64,
}

impl RedisLock {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            ttl_ms: 30_000,
            wait_ms: 3_000,
            poll_ms: 100,
        }
    }

    fn key(name: &str) -> String {
        format!("reconciler:lock:{name}")
    }
}

#[async_trait::async_trait]
impl NamedLock for RedisLock {
    async fn acquire(&self, name: &str) -> Result<AcquiredLock> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::key(name);
        let token = Uuid::new_v4().to_string();
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(self.wait_ms);

        loop {
            let set: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.ttl_ms)
                .query_async(&mut conn)
                .await?;

            if set.is_some() {
                return Ok(AcquiredLock {
                    name: name.to_string(),
                    token,
                    acquired: true,
                });
            }
            if std::time::Instant::now() >= deadline {
                return Ok(AcquiredLock {
                    name: name.to_string(),
                    token,
                    acquired: false,
                });
            }
            tokio::time::sleep(std::time::Duration::from_millis(self.poll_ms)).await;
        }
    }

    async fn release(&self, lock: &AcquiredLock) -> Result<()> {
        if !lock.acquired {
            return Ok(());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(Self::key(&lock.name))
            .arg(&lock.token)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
