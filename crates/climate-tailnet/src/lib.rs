//! # climate-tailnet
//!
//! The overlay-network collaborator, reduced to the two capabilities the
//! broker consumes: *bind a listening socket on the tailnet interface* and
//! *who is the peer at this remote address*.
//!
//! Go servers embed a tailnet node in-process via tsnet; no such library
//! exists for Rust, so [`Tailnet`] drives a tailscaled daemon through the
//! `tailscale` CLI instead — reusing a reachable daemon or supervising a
//! dedicated one rooted at the configured state directory. Binding on the
//! node's own tailnet address keeps peer source addresses real, which is
//! what makes [`PeerResolver::whois`] authoritative for identity.

#![deny(unsafe_code)]

pub mod node;

pub use node::{Peer, PeerResolver, Tailnet, TailnetConfig, TailnetError};
