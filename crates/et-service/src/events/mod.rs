//! Event fan-out to event-channel subscribers

mod hub;

pub use hub::{EventHub, HubDispatcher, SubscriberId};
