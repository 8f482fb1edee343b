//! # climate-events
//!
//! Per-client event bus with bounded replay and monotonic ids.
//!
//! A [`EventHub`] assigns strictly increasing ids to published events, keeps
//! the most recent events in a bounded ring for replay, and fans live events
//! out to any number of subscriber queues without ever blocking the
//! publisher. Slow subscribers drop events; reconnecting with the last seen
//! id replays the missed window.

#![deny(unsafe_code)]

pub mod hub;

pub use hub::{Event, EventHub, Subscription, DEFAULT_CAPACITY};
