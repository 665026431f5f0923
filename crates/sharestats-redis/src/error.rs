use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
}
