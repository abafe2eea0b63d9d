use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::live::LiveState;
use crate::model::{Action, DeviceStatus, DeviceType};

/// Outbound side of the broker connection.
pub trait CommandTransport: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

/// Never waits for room in the request channel: callers hold a device's
/// status lock here, and the event loop draining the channel takes that
/// same lock for status echoes. A full queue fails the command.
impl CommandTransport for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send {
        let result = self
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish to {topic} failed"));
        async move { result }
    }
}

/// `{"pump":1}` / `{"fan":0}`
pub fn encode_command(device: DeviceType, action: Action) -> Vec<u8> {
    let mut body = Map::new();
    body.insert(device.as_str().to_string(), Value::from(action.bit()));
    Value::Object(body).to_string().into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Published,
    /// The device was already known to be in the requested state.
    Suppressed,
}

/// Turns device/action pairs into control messages and keeps the
/// in-memory [`DeviceStatus`] in step with what was sent.
pub struct CommandPublisher<T> {
    transport: T,
    control_topic: String,
    live: Arc<LiveState>,
}

impl<T: CommandTransport> CommandPublisher<T> {
    pub fn new(transport: T, control_topic: impl Into<String>, live: Arc<LiveState>) -> Self {
        Self {
            transport,
            control_topic: control_topic.into(),
            live,
        }
    }

    /// Publish unconditionally. Status is updated only once the message
    /// was queued for the broker.
    pub async fn send(&self, device: DeviceType, action: Action) -> Result<()> {
        let mut status = self.live.lock_status(device).await;
        self.publish_locked(device, action).await?;
        *status = DeviceStatus::from(action);
        Ok(())
    }

    /// Publish unless the device is already known to be in that state.
    /// The status check and the publish happen under the device's lock.
    pub async fn send_if_changed(&self, device: DeviceType, action: Action) -> Result<Delivery> {
        let mut status = self.live.lock_status(device).await;
        if status.satisfies(action) {
            return Ok(Delivery::Suppressed);
        }
        self.publish_locked(device, action).await?;
        *status = DeviceStatus::from(action);
        Ok(Delivery::Published)
    }

    async fn publish_locked(&self, device: DeviceType, action: Action) -> Result<()> {
        let payload = encode_command(device, action);
        match self.transport.publish(&self.control_topic, payload).await {
            Ok(()) => {
                info!(device = %device, action = %action, topic = %self.control_topic, "command published");
                Ok(())
            }
            Err(e) => {
                warn!(device = %device, action = %action, error = %format!("{e:#}"), "command publish failed");
                Err(e)
            }
        }
    }
}
