// src/rabbitmq/connection.rs
// Pooled lapin connections with a bounded size and reconnect backoff.

use lapin::{uri::AMQPUri, Connection, ConnectionProperties};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::errors::{Result, RpcError};

pub struct ConnectionPool {
    uri: AMQPUri,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    max_reconnect_attempts: u32,
    reconnect_delay_ms: u64,
}

fn lock_idle(idle: &Mutex<Vec<Connection>>) -> MutexGuard<'_, Vec<Connection>> {
    // The idle list holds no cross-entry invariants; a poisoned guard is still usable.
    match idle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ConnectionPool {
    pub fn new(uri: AMQPUri, max_connections: usize) -> Self {
        ConnectionPool {
            uri,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    /// Take a connection out of the pool, waiting while the pool is exhausted.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Connection("connection pool is closed".to_string()))?;

        let reusable = {
            let mut idle = lock_idle(&self.idle);
            // Broken connections are dropped on the floor
            idle.retain(|conn| conn.status().connected());
            idle.pop()
        };

        let connection = match reusable {
            Some(conn) => {
                debug!("Reusing pooled RabbitMQ connection");
                conn
            }
            None => self.establish_connection().await?,
        };

        Ok(PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    async fn establish_connection(&self) -> Result<Connection> {
        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;
        let properties = ConnectionProperties::default().with_connection_name("rabbit_rpc".into());

        loop {
            info!(
                host = %self.uri.authority.host,
                vhost = %self.uri.vhost,
                "Attempting to connect to RabbitMQ"
            );

            match Connection::connect_uri(self.uri.clone(), properties.clone()).await {
                Ok(conn) => {
                    info!("Successfully connected to RabbitMQ");
                    return Ok(conn);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, self.max_reconnect_attempts, err
                    );

                    if attempts >= self.max_reconnect_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(RpcError::Connection(err.to_string()));
                    }

                    // Exponential backoff with jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
                    info!("Waiting {}ms before next reconnect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay * 2, 30_000);
                }
            }
        }
    }

    fn release(&self, connection: Connection) {
        if connection.status().connected() {
            lock_idle(&self.idle).push(connection);
        } else {
            warn!("Discarding disconnected RabbitMQ connection");
        }
    }

    /// Close every idle connection and refuse further acquisitions.
    pub async fn close(&self) -> Result<()> {
        self.permits.close();
        let idle: Vec<Connection> = lock_idle(&self.idle).drain(..).collect();
        for conn in idle {
            info!("Closing RabbitMQ connection gracefully");
            conn.close(0, "Closing connection pool").await?;
        }
        Ok(())
    }
}

/// A connection on loan from a [`ConnectionPool`]; returned to it on drop.
pub struct PooledConnection {
    connection: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only vacated inside Drop
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
