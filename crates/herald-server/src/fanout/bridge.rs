//! Inbound side of fan-out: peers' envelopes redelivered to this process's
//! connections.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{BoxStream, SelectAll};
use herald_core::ProcessId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::envelope::FanoutMessage;
use super::{FanoutAddress, FanoutTransport};
use crate::delivery::LocalDelivery;
use crate::metrics::{FANOUT_DECODE_FAILURES_TOTAL, FANOUT_RECEIVED_TOTAL};

/// Merged subscriptions on both addresses, tagged with their address.
pub type InboundStreams = SelectAll<BoxStream<'static, (FanoutAddress, String)>>;

/// Delay before resubscribing after a subscription is lost.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// What happened to one inbound envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Redelivered locally; `attempted` connections were written to.
    Delivered {
        /// Local write attempts.
        attempted: usize,
    },
    /// Published by this process, which already delivered it.
    SelfOrigin,
    /// Malformed or unroutable; nothing was delivered.
    Dropped,
}

/// Redeliver one raw envelope through `local`.
///
/// `address` is where the envelope arrived; `None` routes by its target list.
/// Never fails: malformed input is logged and dropped.
pub(crate) fn redeliver(
    local: &LocalDelivery,
    origin: &ProcessId,
    address: Option<FanoutAddress>,
    raw: &str,
) -> BridgeOutcome {
    let message = match FanoutMessage::decode(raw) {
        Ok(message) => message,
        Err(error) => {
            let label = address.map_or("log", FanoutAddress::as_str);
            metrics::counter!(FANOUT_DECODE_FAILURES_TOTAL, "address" => label).increment(1);
            warn!(
                address = label,
                %error,
                bytes = raw.len(),
                "dropping malformed fan-out envelope"
            );
            return BridgeOutcome::Dropped;
        }
    };

    if &message.origin_process_id == origin {
        return BridgeOutcome::SelfOrigin;
    }

    let address = address.unwrap_or_else(|| message.address());
    let id = message.event_id.clone();
    let report = match (address, &message.target_users) {
        (FanoutAddress::Broadcast, _) => {
            local.broadcast_event(&message.event_name, message.data.clone(), id)
        }
        (FanoutAddress::Targeted, Some(targets)) => {
            local.send_event(targets, &message.event_name, message.data.clone(), id)
        }
        (FanoutAddress::Targeted, None) => {
            metrics::counter!(FANOUT_DECODE_FAILURES_TOTAL, "address" => address.as_str())
                .increment(1);
            warn!(
                %address,
                event_name = %message.event_name,
                "targeted envelope without targets dropped"
            );
            return BridgeOutcome::Dropped;
        }
    };

    metrics::counter!(FANOUT_RECEIVED_TOTAL, "address" => address.as_str()).increment(1);
    debug!(
        %address,
        origin = %message.origin_process_id,
        event_id = %report.event.id,
        event_name = %report.event.name,
        attempted = report.attempted,
        "fan-out envelope redelivered"
    );
    BridgeOutcome::Delivered {
        attempted: report.attempted,
    }
}

/// Subscribes to both fan-out addresses and redelivers what arrives.
pub struct FanoutBridge {
    transport: Arc<dyn FanoutTransport>,
    local: Arc<LocalDelivery>,
    origin: ProcessId,
}

impl FanoutBridge {
    /// Create a bridge for the process identified by `origin`.
    pub fn new(
        transport: Arc<dyn FanoutTransport>,
        local: Arc<LocalDelivery>,
        origin: ProcessId,
    ) -> Self {
        Self {
            transport,
            local,
            origin,
        }
    }

    /// Handle one envelope received on `address`.
    pub fn handle_inbound(&self, address: FanoutAddress, raw: &str) -> BridgeOutcome {
        redeliver(&self.local, &self.origin, Some(address), raw)
    }

    /// Subscribe to both addresses.
    ///
    /// Resolves once both subscriptions are live, so envelopes published
    /// after it returns are not missed by [`FanoutBridge::run_from`].
    pub async fn subscribe(&self) -> Option<InboundStreams> {
        let mut streams = SelectAll::new();
        for address in FanoutAddress::ALL {
            match self.transport.subscribe(address).await {
                Ok(stream) => streams.push(stream.map(move |raw| (address, raw)).boxed()),
                Err(error) => {
                    warn!(
                        transport = self.transport.name(),
                        %address,
                        %error,
                        "fan-out subscribe failed"
                    );
                    return None;
                }
            }
        }
        Some(streams)
    }

    /// Run until `cancel` fires, resubscribing whenever a subscription ends.
    pub async fn run(self, cancel: CancellationToken) {
        self.run_from(None, cancel).await;
    }

    /// Like [`FanoutBridge::run`], starting on `initial` subscriptions when
    /// given.
    #[tracing::instrument(skip_all, name = "fanout_bridge", fields(origin = %self.origin))]
    pub async fn run_from(self, mut initial: Option<InboundStreams>, cancel: CancellationToken) {
        loop {
            let subscribed = match initial.take() {
                Some(streams) => Some(streams),
                None => tokio::select! {
                    s = self.subscribe() => s,
                    () = cancel.cancelled() => break,
                },
            };
            if let Some(streams) = subscribed {
                info!(transport = self.transport.name(), "fan-out bridge subscribed");
                if self.pump(streams, &cancel).await {
                    break;
                }
                warn!(
                    transport = self.transport.name(),
                    "fan-out subscription lost, resubscribing"
                );
            }
            tokio::select! {
                () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                () = cancel.cancelled() => break,
            }
        }
        info!("fan-out bridge stopped");
    }

    /// Returns `true` when stopped by `cancel`.
    async fn pump(
        &self,
        mut streams: InboundStreams,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                next = streams.next() => match next {
                    Some((address, raw)) => {
                        let _ = self.handle_inbound(address, &raw);
                    }
                    None => return false,
                },
                () = cancel.cancelled() => return true,
            }
        }
    }
}
