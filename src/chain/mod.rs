//! Chain access: a failover JSON-RPC pool and a push stream of token
//! `Transfer` events.
//!
//! Two transports back the gateway. Request/response calls go through
//! [`RpcPool`], which walks an ordered endpoint list and fails over on
//! timeout, explicit error, or HTTP 503. The push path is [`TransferStream`],
//! a long-lived task that subscribes to the token contract's `Transfer`
//! topic over WebSocket, reconnects with backoff, and downgrades the
//! advertised [`ChainCapability`](crate::types::ChainCapability) to
//! pull-only after repeated failures so the observer can keep ingesting.

mod rpc;
mod stream;

pub use rpc::RpcPool;
pub use stream::TransferStream;

use alloy::sol;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract ERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function balanceOf(address owner) external view returns (uint256);
        function decimals() external view returns (uint8);
        function transfer(address to, uint256 value) external returns (bool);
    }
}

/// Connect timeout for a single endpoint attempt.
pub const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// A single endpoint rejected or timed out on the call.
    #[error("rpc call failed: {0}")]
    Rpc(String),
    /// The endpoint answered 503; callers back off harder before retrying.
    #[error("rpc endpoint overloaded: {0}")]
    ServiceUnavailable(String),
    /// Every configured endpoint failed for this call.
    #[error("all rpc endpoints failed: {0}")]
    AllEndpointsFailed(String),
    /// The broadcast transaction reverted on chain.
    #[error("transaction {0} reverted")]
    Reverted(String),
    /// The response shape was not usable (missing receipt fields etc.).
    #[error("malformed chain response: {0}")]
    Malformed(String),
}

impl ChainError {
    /// Wrap a transport/contract error, classifying 503 responses.
    pub(crate) fn from_display(e: impl std::fmt::Display) -> Self {
        let text = e.to_string();
        if text.contains("503") || text.contains("Service Unavailable") {
            ChainError::ServiceUnavailable(text)
        } else {
            ChainError::Rpc(text)
        }
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, ChainError::ServiceUnavailable(_))
    }
}
