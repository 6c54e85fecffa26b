use std::{collections::HashMap, fmt::Debug};

use redis::{
    aio::MultiplexedConnection, cluster::ClusterClientBuilder, cluster_async::ClusterConnection,
    AsyncCommands, Client, FromRedisValue, RedisResult,
};

/// Configuration for a Redis connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The nodes to use to connect to the Redis cluster or instance.
    pub nodes: Vec<String>,
    /// The password to use to connect to the Redis cluster or instance.
    pub password: Option<String>,
    /// Whether to use cluster mode for the Redis connection.
    pub cluster_mode: bool,
}

/// A wrapper around a Redis connection that can be used to
/// get a connection to a Redis cluster or instance.
/// This provides a unified interface for both single node and cluster mode
/// connections for the subset of Redis commands used by the conveyor stores.
pub enum ConnectionWrapper {
    Cluster(ClusterConnection),
    SingleNode(MultiplexedConnection),
}

impl Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionWrapper::Cluster(_) => {
                write!(f, "ConnectionWrapper::Cluster")
            }
            ConnectionWrapper::SingleNode(_) => write!(f, "ConnectionWrapper::SingleNode"),
        }
    }
}

impl Clone for ConnectionWrapper {
    fn clone(&self) -> Self {
        match self {
            ConnectionWrapper::Cluster(conn) => ConnectionWrapper::Cluster(conn.clone()),
            ConnectionWrapper::SingleNode(conn) => ConnectionWrapper::SingleNode(conn.clone()),
        }
    }
}

impl ConnectionWrapper {
    /// Returns whether the key exists.
    /// [Redis Docs](https://redis.io/commands/EXISTS)
    pub async fn exists(&mut self, key: &str) -> RedisResult<bool> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.exists(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.exists(key).await,
        }
    }

    /// Set the value and expiration of a key, in milliseconds.
    /// [Redis Docs](https://redis.io/commands/SET)
    pub async fn pset_ex(&mut self, key: &str, value: &str, expire_ms: u64) -> RedisResult<bool> {
        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => conn.pset_ex(key, value, expire_ms).await?,
            ConnectionWrapper::SingleNode(conn) => conn.pset_ex(key, value, expire_ms).await?,
        };

        Ok(result.is_some())
    }

    /// Removes the key, a no-op when it does not exist.
    /// [Redis Docs](https://redis.io/commands/DEL)
    pub async fn del(&mut self, key: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.del(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.del(key).await,
        }
    }

    /// Returns the value of a single hash field.
    /// [Redis Docs](https://redis.io/commands/HGET)
    pub async fn hget(&mut self, key: &str, field: &str) -> RedisResult<Option<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.hget(key, field).await,
            ConnectionWrapper::SingleNode(conn) => conn.hget(key, field).await,
        }
    }

    /// Returns all fields and values of the hash stored at the key,
    /// an empty map when the key does not exist.
    /// [Redis Docs](https://redis.io/commands/HGETALL)
    pub async fn hgetall(&mut self, key: &str) -> RedisResult<HashMap<String, String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.hgetall(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.hgetall(key).await,
        }
    }

    /// Evaluates a Lua script.
    /// [Redis Docs](https://redis.io/commands/EVAL)
    pub async fn eval_script<T: Default + FromRedisValue>(
        &mut self,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> RedisResult<T> {
        if keys.is_empty() {
            return Ok(T::default());
        }

        let script_obj = redis::Script::new(script);
        let mut script_invocation = &mut script_obj.key(keys[0]);
        for key in keys.iter().skip(1) {
            script_invocation = script_invocation.key(key);
        }

        for arg in args {
            script_invocation = script_invocation.arg(arg);
        }

        let expected: T = match self {
            ConnectionWrapper::Cluster(conn) => script_invocation.invoke_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => script_invocation.invoke_async(conn).await?,
        };

        Ok(expected)
    }
}

/// Creates a connection to a Redis cluster or instance.
pub async fn get_redis_connection(
    conn_config: &ConnectionConfig,
) -> RedisResult<ConnectionWrapper> {
    if !conn_config.cluster_mode {
        let client = Client::open(conn_config.nodes[0].clone())?;
        return Ok(ConnectionWrapper::SingleNode(
            client.get_multiplexed_async_connection().await?,
        ));
    }

    let mut builder = ClusterClientBuilder::new(conn_config.nodes.clone());
    if let Some(password) = conn_config.password.clone() {
        builder = builder.password(password);
    }
    let client = builder.build()?;

    Ok(ConnectionWrapper::Cluster(
        client.get_async_connection().await?,
    ))
}
