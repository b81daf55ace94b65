//! Redis-backed coordination store.
//!
//! Protocol steps that read before they write (reserve, acknowledge, requeue,
//! heartbeat, finish, abandon) run as Lua scripts so each is one atomic step on the server. Publishing
//! the backlog is a MULTI/EXEC pipeline. All keys of a build share the
//! `{...}` hash tag produced by [`BuildKeys`], so scripts stay single-slot on
//! a cluster.
//!
//! Environment variables:
//! - `REDIS_URL` (default `redis://localhost:6379`)

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use redis::{Connection, RedisError, Script};
use tracing::{debug, warn};

use leaseq_core::{MasterStatus, RequeueBudget, StoreError, WorkerId};

use super::{CoordinationStore, QueueCounts, RequeueOutcome, Reservation, StoreResult};
use crate::keys::{BuildKeys, TOTAL_REQUEUES_FIELD};

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
        StoreError::connection(err.to_string())
    } else {
        StoreError::command(err.to_string())
    }
}

struct Scripts {
    reserve: Script,
    acknowledge: Script,
    requeue: Script,
    heartbeat: Script,
    finish: Script,
    abandon: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            reserve: Script::new(include_str!("lua/reserve.lua")),
            acknowledge: Script::new(include_str!("lua/acknowledge.lua")),
            requeue: Script::new(include_str!("lua/requeue.lua")),
            heartbeat: Script::new(include_str!("lua/heartbeat.lua")),
            finish: Script::new(include_str!("lua/finish.lua")),
            abandon: Script::new(include_str!("lua/abandon.lua")),
        }
    }
}

/// Coordination store on a single Redis (or one cluster slot per build).
///
/// Holds one lazily opened connection; a connection-level failure drops it
/// and the next call reconnects.
pub struct RedisStore {
    client: redis::Client,
    url: String,
    conn: Mutex<Option<Connection>>,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("url", &self.url).finish_non_exhaustive()
    }
}

impl RedisStore {
    pub fn new(redis_url: impl AsRef<str>) -> StoreResult<Self> {
        let url = redis_url.as_ref().to_string();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StoreError::connection(e.to_string()))?;
        Ok(Self {
            client,
            url,
            conn: Mutex::new(None),
            scripts: Scripts::load(),
        })
    }

    /// Build from `REDIS_URL`, falling back to a local server.
    pub fn from_env() -> StoreResult<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        Self::new(url)
    }

    fn with_conn<T>(&self, op: impl FnOnce(&mut Connection) -> redis::RedisResult<T>) -> StoreResult<T> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        if guard.is_none() {
            let conn = self.client.get_connection().map_err(map_redis_error)?;
            debug!(url = %self.url, "opened redis connection");
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::connection("redis connection unavailable"));
        };

        match op(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                let err = map_redis_error(err);
                if err.is_transient() {
                    warn!(url = %self.url, error = %err, "dropping redis connection");
                    *guard = None;
                }
                Err(err)
            }
        }
    }
}

impl CoordinationStore for RedisStore {
    fn try_elect(&self, keys: &BuildKeys) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let reply: Option<String> = redis::cmd("SET")
                .arg(keys.master_status())
                .arg(MasterStatus::Setup.as_str())
                .arg("NX")
                .arg("EX")
                .arg(keys.ttl_secs())
                .query(conn)?;
            Ok(reply.is_some())
        })
    }

    fn push(&self, keys: &BuildKeys, items: &[String], created_at: f64) -> StoreResult<()> {
        let ttl = keys.ttl_secs();
        self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            if !items.is_empty() {
                pipe.cmd("LPUSH").arg(keys.pending()).arg(items).ignore();
                pipe.cmd("EXPIRE").arg(keys.pending()).arg(ttl).ignore();
            }
            pipe.cmd("SET").arg(keys.total()).arg(items.len()).arg("EX").arg(ttl).ignore();
            pipe.cmd("SET").arg(keys.created_at()).arg(created_at).arg("EX").arg(ttl).ignore();
            pipe.cmd("SET")
                .arg(keys.master_status())
                .arg(MasterStatus::Ready.as_str())
                .arg("EX")
                .arg(ttl)
                .ignore();
            pipe.query::<()>(conn)
        })
    }

    fn master_status(&self, keys: &BuildKeys) -> StoreResult<MasterStatus> {
        let raw: Option<String> =
            self.with_conn(|conn| redis::cmd("GET").arg(keys.master_status()).query(conn))?;
        MasterStatus::parse(raw.as_deref())
    }

    fn abandon_setup(&self, keys: &BuildKeys) -> StoreResult<()> {
        self.with_conn(|conn| {
            self.scripts
                .abandon
                .key(keys.master_status())
                .invoke::<i64>(conn)
                .map(|_| ())
        })
    }

    fn mark_finished(&self, keys: &BuildKeys) -> StoreResult<()> {
        self.with_conn(|conn| {
            self.scripts
                .finish
                .key(keys.master_status())
                .arg(keys.ttl_secs())
                .invoke::<i64>(conn)
                .map(|_| ())
        })
    }

    fn register_worker(&self, keys: &BuildKeys, worker: &WorkerId) -> StoreResult<()> {
        self.with_conn(|conn| {
            redis::pipe()
                .atomic()
                .cmd("SADD")
                .arg(keys.workers())
                .arg(worker.as_str())
                .ignore()
                .cmd("EXPIRE")
                .arg(keys.workers())
                .arg(keys.ttl_secs())
                .ignore()
                .query::<()>(conn)
        })
    }

    fn workers(&self, keys: &BuildKeys) -> StoreResult<Vec<WorkerId>> {
        let mut ids: Vec<String> =
            self.with_conn(|conn| redis::cmd("SMEMBERS").arg(keys.workers()).query(conn))?;
        ids.sort();
        Ok(ids.into_iter().map(WorkerId::from).collect())
    }

    fn reserve(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        now: f64,
        timeout: Duration,
    ) -> StoreResult<Option<Reservation>> {
        let leased: Option<(String, i64)> = self.with_conn(|conn| {
            self.scripts
                .reserve
                .key(keys.pending())
                .key(keys.reserved())
                .key(keys.owners())
                .key(keys.processed())
                .arg(worker.as_str())
                .arg(now)
                .arg(timeout.as_secs_f64())
                .arg(keys.ttl_secs())
                .invoke(conn)
        })?;
        Ok(leased.map(|(item, reclaimed)| Reservation {
            item,
            reclaimed: reclaimed == 1,
        }))
    }

    fn heartbeat(&self, keys: &BuildKeys, worker: &WorkerId, item: &str, now: f64) -> StoreResult<bool> {
        let renewed: i64 = self.with_conn(|conn| {
            self.scripts
                .heartbeat
                .key(keys.reserved())
                .key(keys.owners())
                .arg(item)
                .arg(worker.as_str())
                .arg(now)
                .invoke(conn)
        })?;
        Ok(renewed == 1)
    }

    fn acknowledge(&self, keys: &BuildKeys, worker: &WorkerId, item: &str) -> StoreResult<bool> {
        let added: i64 = self.with_conn(|conn| {
            self.scripts
                .acknowledge
                .key(keys.reserved())
                .key(keys.owners())
                .key(keys.processed())
                .key(keys.completed(worker))
                .arg(item)
                .arg(worker.as_str())
                .arg(keys.ttl_secs())
                .invoke(conn)
        })?;
        Ok(added == 1)
    }

    fn requeue(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        budget: &RequeueBudget,
        offset: usize,
    ) -> StoreResult<RequeueOutcome> {
        let outcome: String = self.with_conn(|conn| {
            self.scripts
                .requeue
                .key(keys.pending())
                .key(keys.reserved())
                .key(keys.owners())
                .key(keys.processed())
                .key(keys.requeues())
                .key(keys.error_reports())
                .key(keys.completed(worker))
                .arg(item)
                .arg(worker.as_str())
                .arg(budget.max_requeues)
                .arg(budget.global_max_requeues)
                .arg(offset)
                .arg(keys.ttl_secs())
                .arg(TOTAL_REQUEUES_FIELD)
                .invoke(conn)
        })?;
        match outcome.as_str() {
            "requeued" => Ok(RequeueOutcome::Requeued),
            "exhausted" => Ok(RequeueOutcome::Exhausted),
            "not_owned" => Ok(RequeueOutcome::NotOwned),
            other => Err(StoreError::corrupt(format!("unexpected requeue reply {other:?}"))),
        }
    }

    fn counts(&self, keys: &BuildKeys) -> StoreResult<QueueCounts> {
        let (pending, reserved, processed): (usize, usize, usize) = self.with_conn(|conn| {
            redis::pipe()
                .cmd("LLEN")
                .arg(keys.pending())
                .cmd("ZCARD")
                .arg(keys.reserved())
                .cmd("SCARD")
                .arg(keys.processed())
                .query(conn)
        })?;
        Ok(QueueCounts {
            pending,
            reserved,
            processed,
        })
    }

    fn total(&self, keys: &BuildKeys) -> StoreResult<Option<usize>> {
        self.with_conn(|conn| redis::cmd("GET").arg(keys.total()).query(conn))
    }

    fn created_at(&self, keys: &BuildKeys) -> StoreResult<Option<f64>> {
        self.with_conn(|conn| redis::cmd("GET").arg(keys.created_at()).query(conn))
    }

    fn owner(&self, keys: &BuildKeys, item: &str) -> StoreResult<Option<WorkerId>> {
        let owner: Option<String> =
            self.with_conn(|conn| redis::cmd("HGET").arg(keys.owners()).arg(item).query(conn))?;
        Ok(owner.map(WorkerId::from))
    }

    fn requeue_counts(&self, keys: &BuildKeys, item: &str) -> StoreResult<(u32, u64)> {
        let (used, total): (Option<u32>, Option<u64>) = self.with_conn(|conn| {
            redis::cmd("HMGET")
                .arg(keys.requeues())
                .arg(item)
                .arg(TOTAL_REQUEUES_FIELD)
                .query(conn)
        })?;
        Ok((used.unwrap_or(0), total.unwrap_or(0)))
    }

    fn completed_log(&self, keys: &BuildKeys, worker: &WorkerId) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            redis::cmd("LRANGE")
                .arg(keys.completed(worker))
                .arg(0)
                .arg(-1)
                .query(conn)
        })
    }

    fn record_error(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        payload: &str,
        stats: &[(&str, f64)],
    ) -> StoreResult<()> {
        let ttl = keys.ttl_secs();
        self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("HSET").arg(keys.error_reports()).arg(item).arg(payload).ignore();
            pipe.cmd("EXPIRE").arg(keys.error_reports()).arg(ttl).ignore();
            for (name, value) in stats {
                pipe.cmd("HSET").arg(keys.stat(name)).arg(worker.as_str()).arg(*value).ignore();
                pipe.cmd("EXPIRE").arg(keys.stat(name)).arg(ttl).ignore();
            }
            pipe.query::<()>(conn)
        })
    }

    fn record_success(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        stats: &[(&str, f64)],
    ) -> StoreResult<()> {
        let ttl = keys.ttl_secs();
        self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("HDEL").arg(keys.error_reports()).arg(item).ignore();
            for (name, value) in stats {
                pipe.cmd("HSET").arg(keys.stat(name)).arg(worker.as_str()).arg(*value).ignore();
                pipe.cmd("EXPIRE").arg(keys.stat(name)).arg(ttl).ignore();
            }
            pipe.query::<()>(conn)
        })
    }

    fn error_reports(&self, keys: &BuildKeys) -> StoreResult<BTreeMap<String, String>> {
        let reports: HashMap<String, String> =
            self.with_conn(|conn| redis::cmd("HGETALL").arg(keys.error_reports()).query(conn))?;
        Ok(reports.into_iter().collect())
    }

    fn stat_values(&self, keys: &BuildKeys, stat: &str) -> StoreResult<Vec<f64>> {
        self.with_conn(|conn| redis::cmd("HVALS").arg(keys.stat(stat)).query(conn))
    }
}
