//! Heartbeat negotiation helpers.
//!
//! Each side advertises `own,expected` in milliseconds. A receiver swaps the
//! pair to line it up with its own view before negotiating.

use std::time::Duration;

const GRACE_PERIOD: f64 = 0.5;

/// Upper bound for a negotiated interval (one day), whatever the peer offers.
pub const MAX_HEARTBEAT_MS: u64 = 24 * 60 * 60 * 1000;

/// Interval at which to emit our own heartbeat so the peer never sees us late.
pub fn reduce_grace_period(interval: u64) -> u64 {
    interval - (interval as f64 * GRACE_PERIOD) as u64
}

/// Interval after which a missing inbound heartbeat is considered overdue.
pub fn add_grace_period(interval: u64) -> u64 {
    interval.saturating_add((interval as f64 * GRACE_PERIOD) as u64)
}

/// Swap an `own,expected` pair.
///
/// Malformed input is returned untouched.
pub fn swap_heartbeat(heartbeat: &str) -> String {
    match heartbeat.split_once(',') {
        Some((own, expected)) => format!("{},{}", expected.trim(), own.trim()),
        None => heartbeat.to_string(),
    }
}

/// Parse an `own,expected` pair.
pub fn parse_heartbeat(heartbeat: &str) -> Option<(u64, u64)> {
    let (own, expected) = heartbeat.split_once(',')?;
    Some((own.trim().parse().ok()?, expected.trim().parse().ok()?))
}

/// Render an `own,expected` pair.
pub fn format_heartbeat(own: Duration, expected: Duration) -> String {
    format!("{},{}", own.as_millis(), expected.as_millis())
}

/// Effective heartbeat cadence for one direction; zero on either side disables it.
pub fn negotiate(ours: u64, theirs: u64) -> u64 {
    if ours == 0 || theirs == 0 {
        0
    } else {
        ours.max(theirs).min(MAX_HEARTBEAT_MS)
    }
}

/// Negotiated `(outgoing, incoming)` intervals from our offer and the peer's
/// advertised `heart-beat` header.
pub fn negotiate_pair(outgoing: u64, incoming: u64, peer_header: &str) -> Option<(u64, u64)> {
    // Peer says "what I send, what I want"; swapped it reads "what I want
    // from you, what I send you".
    let (peer_wants, peer_sends) = parse_heartbeat(&swap_heartbeat(peer_header))?;
    Some((negotiate(outgoing, peer_wants), negotiate(incoming, peer_sends)))
}
