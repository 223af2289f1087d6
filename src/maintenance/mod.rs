//! Background maintenance workers.
//!
//! Both workers run as independent long-lived tasks on their own timers:
//! the [`CountersAggregator`](counters::CountersAggregator) bounds counter
//! table growth by folding delta rows into running totals, and the
//! [`ExpirationManager`](expiration::ExpirationManager) sweeps expired rows
//! out of every persisted record table, serialized across the fleet by the
//! distributed maintenance lock.

pub mod counters;
pub mod expiration;

pub use counters::CountersAggregator;
pub use expiration::ExpirationManager;
