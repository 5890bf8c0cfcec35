//! Typed access to the relational store.

mod alerts;
mod channels;
mod notifications;
mod rules;

pub use alerts::{AlertFilter, AlertStore};
pub use channels::ChannelStore;
pub use notifications::NotificationStore;
pub use rules::RuleStore;
