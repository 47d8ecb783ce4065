//! BBO fan-out: one hub per adapter, bounded channels per subscription.
//!
//! The wire reader (WebSocket task or paper venue) publishes into the hub;
//! monitor tasks own `BboSubscription`s and pull at their own pace. A full
//! channel drops the incoming quote — BBO is last-value data and the next
//! tick supersedes it — so a slow consumer can never back-pressure the
//! reader or grow memory.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::Bbo;
use crate::model::VenueId;

/// Per-subscription buffer. Small on purpose: quotes are superseded, not
/// queued.
const CHANNEL_CAPACITY: usize = 32;

/// Receiving half of one `(venue, symbol)` BBO subscription. Dropping it
/// detaches the subscription from the hub.
pub struct BboSubscription {
    pub venue: VenueId,
    pub symbol: String,
    rx: mpsc::Receiver<Bbo>,
}

impl BboSubscription {
    /// Next quote, `None` once the publisher side is gone.
    pub async fn recv(&mut self) -> Option<Bbo> {
        self.rx.recv().await
    }

    /// Drain anything buffered and return only the freshest quote, if any.
    pub fn latest(&mut self) -> Option<Bbo> {
        let mut last = None;
        while let Ok(bbo) = self.rx.try_recv() {
            last = Some(bbo);
        }
        last
    }
}

struct Topic {
    senders: Vec<mpsc::Sender<Bbo>>,
    /// Re-delivered to new subscribers so a reconnect always yields at
    /// least one current quote.
    last: Option<Bbo>,
}

/// Publish/subscribe hub for one venue's BBO quotes.
pub struct BboHub {
    venue: VenueId,
    topics: Mutex<HashMap<String, Topic>>,
}

impl BboHub {
    pub fn new(venue: impl Into<VenueId>) -> Arc<Self> {
        Arc::new(BboHub {
            venue: venue.into(),
            topics: Mutex::new(HashMap::new()),
        })
    }

    /// Register a subscription for `symbol`. The current BBO, when known,
    /// is delivered immediately.
    pub async fn subscribe(&self, symbol: &str) -> BboSubscription {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(symbol.to_string()).or_insert_with(|| Topic {
            senders: Vec::new(),
            last: None,
        });
        if let Some(last) = topic.last {
            let _ = tx.try_send(last);
        }
        topic.senders.push(tx);

        BboSubscription {
            venue: self.venue.clone(),
            symbol: symbol.to_string(),
            rx,
        }
    }

    /// Deliver one quote to every live subscriber, pruning dead ones.
    pub async fn publish(&self, symbol: &str, bbo: Bbo) {
        let mut topics = self.topics.lock().await;
        let Some(topic) = topics.get_mut(symbol) else {
            return;
        };
        topic.last = Some(bbo);
        topic.senders.retain(|tx| match tx.try_send(bbo) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(venue = %self.venue, symbol, "bbo consumer lagging, dropping quote");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Replay the last known quote for every topic (used after reconnect).
    pub async fn replay_last(&self) {
        let mut topics = self.topics.lock().await;
        for topic in topics.values_mut() {
            if let Some(last) = topic.last {
                topic.senders.retain(|tx| !matches!(
                    tx.try_send(last),
                    Err(mpsc::error::TrySendError::Closed(_))
                ));
            }
        }
    }

    /// Symbols with at least one live subscriber (the set a reconnect must
    /// re-subscribe on the wire).
    pub async fn active_symbols(&self) -> Vec<String> {
        let mut topics = self.topics.lock().await;
        topics.retain(|_, t| {
            t.senders.retain(|tx| !tx.is_closed());
            !t.senders.is_empty()
        });
        topics.keys().cloned().collect()
    }
}
