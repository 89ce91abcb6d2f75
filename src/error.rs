use crate::queue::AdmissionError;
use http::StatusCode;
use std::fmt;

/// Request-path failures, each carrying the downstream status the proxy
/// emits for it.
#[derive(Debug)]
pub enum ProxyError {
    /// The balancer found no healthy upstream to commit to.
    NoUpstream,
    /// The admission queue's waiting room was full at entry.
    QueueFull,
    /// The enqueue timeout elapsed before an active slot freed up.
    QueueTimeout,
    /// The client went away while the request was queued.
    QueueCancelled,
    /// Transport failure talking to the upstream, client still connected.
    UpstreamConnect(String),
    /// Transport failure observed after the client already cancelled.
    ClientGone(String),
    /// The upstream response body could not be read to completion.
    UpstreamBody(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoUpstream
            | ProxyError::UpstreamConnect(_)
            | ProxyError::UpstreamBody(_) => StatusCode::BAD_GATEWAY,
            ProxyError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::QueueTimeout | ProxyError::QueueCancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::ClientGone(_) => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoUpstream => write!(f, "no healthy upstream available"),
            ProxyError::QueueFull => write!(f, "queue full"),
            ProxyError::QueueTimeout => write!(f, "timed out while waiting in queue"),
            ProxyError::QueueCancelled => write!(f, "request cancelled while waiting in queue"),
            ProxyError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            ProxyError::ClientGone(msg) => write!(f, "client gone during upstream error: {}", msg),
            ProxyError::UpstreamBody(msg) => write!(f, "upstream body read error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<AdmissionError> for ProxyError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::Full => ProxyError::QueueFull,
            AdmissionError::TimedOut => ProxyError::QueueTimeout,
            AdmissionError::Cancelled => ProxyError::QueueCancelled,
        }
    }
}
