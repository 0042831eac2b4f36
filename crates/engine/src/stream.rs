//! Process-wide token stream subscribers.
//!
//! The registry is read by the sampler for every emitted piece. Mutation
//! takes the write lock; by contract subscribers must not be added or
//! cleared while a generation is active.

use std::sync::{Arc, RwLock};

/// A subscriber to streamed token pieces.
#[derive(Clone)]
pub struct StreamSubscriber {
    /// Called once per emitted piece. Must be cheap and must not re-enter
    /// the engine.
    pub on_token: Arc<dyn Fn(&str) + Send + Sync>,
}

static SUBSCRIBERS: RwLock<Vec<StreamSubscriber>> = RwLock::new(Vec::new());

/// Register a subscriber for all future generations.
pub fn add_stream_subscriber(sub: StreamSubscriber) {
    if let Ok(mut subs) = SUBSCRIBERS.write() {
        subs.push(sub);
    }
}

/// Remove every registered subscriber.
pub fn clear_stream_subscribers() {
    if let Ok(mut subs) = SUBSCRIBERS.write() {
        subs.clear();
    }
}

pub(crate) fn notify_subscribers(piece: &str) {
    if let Ok(subs) = SUBSCRIBERS.read() {
        for sub in subs.iter() {
            (sub.on_token)(piece);
        }
    }
}
