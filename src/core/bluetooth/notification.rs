//! Fan-out of unsolicited characteristic values

use log::{debug, trace, warn};

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::feed::EventFeed;
use crate::core::bluetooth::types::{CharacteristicRef, Notification};

/// Publishes value updates that no read was waiting for. Subscribers only see
/// what arrives after they subscribed.
pub struct NotificationRouter {
    feed: EventFeed<Notification>,
}

impl NotificationRouter {
    pub fn new(feed: EventFeed<Notification>) -> Self {
        Self { feed }
    }

    pub fn route(&self, characteristic: CharacteristicRef, value: Result<Vec<u8>, BleError>) {
        match value {
            Ok(value) => {
                trace!("Notification from {}: {:02x?}", characteristic, value);
                self.feed.publish(Notification { characteristic, value });
            }
            Err(e) => warn!("Dropping failed value update from {}: {}", characteristic, e),
        }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> crate::core::bluetooth::feed::Subscription<Notification> {
        debug!("New notification subscriber");
        self.feed.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    pub fn close(&self) {
        debug!("Closing notification stream with {} subscriber(s)", self.subscriber_count());
        self.feed.close();
    }
}
