//! Redis-backed session store.
//!
//! Each session is one hash at `chunk:upload:{id}`. Metadata fields are
//! written together with the `EXPIRE` in a MULTI block; every received chunk
//! adds a `chunk:{index}` field. Adding a field goes through a Lua script
//! that refuses to touch a missing key, so a write racing the TTL can never
//! recreate an expired session without a deadline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use std::{collections::HashMap, time::Duration};

use super::{
    error::{ServiceError, ServiceResult},
    session_store::SessionStore,
};
use crate::models::session::UploadSession;

const CHUNK_FIELD_PREFIX: &str = "chunk:";

// Returns the number of `chunk:` fields after the write, or -1 when the
// session is gone.
const RECORD_CHUNK_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
redis.call('HSET', KEYS[1], ARGV[1], '1')
local received = 0
for _, field in ipairs(redis.call('HKEYS', KEYS[1])) do
    if string.sub(field, 1, #ARGV[2]) == ARGV[2] then
        received = received + 1
    end
end
return received
"#;

fn session_key(upload_id: &str) -> String {
    format!("chunk:upload:{}", upload_id)
}

#[derive(Clone)]
pub struct RedisSessionStore {
    client: Client,
    ttl: Duration,
    record_chunk: Script,
}

impl RedisSessionStore {
    pub fn new(url: &str, ttl: Duration) -> ServiceResult<Self> {
        Ok(Self {
            client: Client::open(url)?,
            ttl,
            record_chunk: Script::new(RECORD_CHUNK_LUA),
        })
    }

    async fn get_conn(&self) -> ServiceResult<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session: &UploadSession) -> ServiceResult<()> {
        let mut conn = self.get_conn().await?;
        let key = session_key(&session.upload_id);
        let fields = session_fields(session);
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, fields.as_slice())
            .ignore()
            .expire(&key, self.ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, upload_id: &str) -> ServiceResult<Option<UploadSession>> {
        let mut conn = self.get_conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(session_key(upload_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        session_from_fields(&fields).map(Some)
    }

    async fn record_chunk(&self, upload_id: &str, index: u32) -> ServiceResult<Option<u32>> {
        let mut conn = self.get_conn().await?;
        let received: i64 = self
            .record_chunk
            .key(session_key(upload_id))
            .arg(format!("{}{}", CHUNK_FIELD_PREFIX, index))
            .arg(CHUNK_FIELD_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(u32::try_from(received).ok())
    }

    async fn delete(&self, upload_id: &str) -> ServiceResult<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.del(session_key(upload_id)).await?;
        Ok(())
    }

    async fn ping(&self) -> ServiceResult<()> {
        let mut conn = self.get_conn().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn session_fields(session: &UploadSession) -> Vec<(String, String)> {
    let mut fields = vec![
        ("upload_id".to_string(), session.upload_id.clone()),
        ("file_name".to_string(), session.file_name.clone()),
        ("file_size".to_string(), session.file_size.to_string()),
        ("chunk_size".to_string(), session.chunk_size.to_string()),
        ("total_chunks".to_string(), session.total_chunks.to_string()),
        ("folder_id".to_string(), session.folder_id.clone()),
        ("user_id".to_string(), session.user_id.clone()),
        ("created_at".to_string(), session.created_at.to_rfc3339()),
    ];
    fields.extend(
        session
            .received
            .iter()
            .map(|i| (format!("{}{}", CHUNK_FIELD_PREFIX, i), "1".to_string())),
    );
    fields
}

fn session_from_fields(fields: &HashMap<String, String>) -> ServiceResult<UploadSession> {
    fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> ServiceResult<&'a str> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ServiceError::Internal(format!("session record missing `{}`", name)))
    }
    fn parse<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> ServiceResult<T> {
        field(fields, name)?
            .parse()
            .map_err(|_| ServiceError::Internal(format!("session field `{}` is malformed", name)))
    }

    let created_at = DateTime::parse_from_rfc3339(field(fields, "created_at")?)
        .map_err(|_| ServiceError::Internal("session field `created_at` is malformed".into()))?
        .with_timezone(&Utc);

    let received = fields
        .keys()
        .filter_map(|k| k.strip_prefix(CHUNK_FIELD_PREFIX))
        .filter_map(|i| i.parse::<u32>().ok())
        .collect();

    Ok(UploadSession {
        upload_id: field(fields, "upload_id")?.to_string(),
        file_name: field(fields, "file_name")?.to_string(),
        file_size: parse(fields, "file_size")?,
        chunk_size: parse(fields, "chunk_size")?,
        total_chunks: parse(fields, "total_chunks")?,
        folder_id: field(fields, "folder_id")?.to_string(),
        user_id: field(fields, "user_id")?.to_string(),
        created_at,
        received,
    })
}
