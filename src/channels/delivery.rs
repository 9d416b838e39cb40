//! Outbound reply delivery

use super::adapter::ChannelAdapter;
use super::message::OutboundMessage;
use crate::error::{Error, Result};
use crate::retry::{retry_async, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Send `message` through `adapter`, bounding each attempt by `timeout` and
/// retrying transient failures per `policy`.
///
/// Returns the platform message id.
pub async fn deliver_reply(
    adapter: Arc<dyn ChannelAdapter>,
    message: OutboundMessage,
    policy: &RetryConfig,
    timeout: Duration,
) -> Result<String> {
    let channel = adapter.name().to_string();
    retry_async(
        policy,
        "channel reply",
        |err, _| err.retryable(),
        |attempt| {
            let adapter = adapter.clone();
            let message = message.clone();
            let channel = channel.clone();
            async move {
                match tokio::time::timeout(timeout, adapter.send_message(message)).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::debug!(channel = %channel, attempt, "Channel send timed out");
                        Err(Error::Unavailable(format!(
                            "{} send timed out after {}ms",
                            channel,
                            timeout.as_millis()
                        )))
                    }
                }
            }
        },
    )
    .await
}
