use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to serialize bridge payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no bridge port could be discovered")]
    PortNotFound,

    #[error("websocket connect to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bridge client has been stopped")]
    Stopped,

    #[error("port store i/o failed: {0}")]
    Store(#[from] std::io::Error),
}

impl BridgeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub(crate) fn connect(url: &str, source: tungstenite::Error) -> Self {
        Self::Connect {
            url: url.to_string(),
            source: Box::new(source),
        }
    }
}

impl From<tungstenite::Error> for BridgeError {
    fn from(error: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(error))
    }
}
