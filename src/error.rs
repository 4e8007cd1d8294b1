use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the orchestration library.
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// The submitted crawl configuration failed validation; the job was
    /// never admitted and will not be retried.
    #[error("invalid crawl configuration: {0}")]
    InvalidConfig(String),

    /// The job id is unknown (never admitted, already reclaimed, or removed
    /// by cancellation).
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// The job is in a state that does not allow the requested transition.
    #[error("job {id} is {state}, cannot {action}")]
    InvalidJobState {
        id: Uuid,
        state: String,
        action: &'static str,
    },

    /// The connection has not completed the authentication handshake.
    #[error("connection is not authenticated")]
    NotAuthenticated,

    /// Token verification failed.
    #[error("invalid or expired token")]
    InvalidToken,

    /// The authenticated user does not own the job they tried to subscribe to.
    #[error("user {user_id} does not own job {job_id}")]
    NotAuthorized { user_id: String, job_id: Uuid },

    /// Per-address connection limits were exceeded.
    #[error("connection rate limit exceeded for {0}")]
    RateLimited(std::net::IpAddr),

    /// The connection id is unknown or already disconnected.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The seed URL never yielded a page; the job as a whole failed and is
    /// eligible for queue-level retry.
    #[error("seed url unreachable: {0}")]
    SeedUnreachable(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, CrawlerError>;
