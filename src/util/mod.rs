//! Utility functions: interface MTU discovery, destination selection,
//! custom resolvers.

pub mod addr;
pub mod mtu;

pub use addr::{check_intersect, select_dst_ip, source_ip_for, ProbeResolver};
pub use mtu::{max_payload_len, maximum_mtu, minimum_mtu};
