//! Astarte MQTT v1 topic conventions and control payloads
//!
//! The device root topic is the certificate common name (`realm/device_id`).
//! Every data topic is `{root}/{interface}{path}`; the `control` subtree is
//! reserved for session management.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Pseudo-interface name reserved for control messages.
pub const CONTROL_INTERFACE: &str = "control";

/// `{root}/control/#`
pub fn control_subscription(root: &str) -> String {
    format!("{root}/{CONTROL_INTERFACE}/#")
}

/// `{root}/control/emptyCache`
pub fn empty_cache_topic(root: &str) -> String {
    format!("{root}/{CONTROL_INTERFACE}/emptyCache")
}

/// `{root}/control/producer/properties`
pub fn producer_properties_topic(root: &str) -> String {
    format!("{root}/{CONTROL_INTERFACE}/producer/properties")
}

/// The two subscriptions needed to receive everything on a consumer interface.
pub fn interface_subscriptions(root: &str, interface: &str) -> [String; 2] {
    [format!("{root}/{interface}"), format!("{root}/{interface}/#")]
}

/// Full topic for a message target (`/{interface}{path}`).
pub fn data_topic(root: &str, target: &str) -> String {
    format!("{root}{target}")
}

/// Build a message target from an interface name and a mapping path.
pub fn build_target(interface: &str, path: &str) -> String {
    format!("/{interface}{path}")
}

/// Strip the device root from an inbound topic, keeping the leading `/`.
///
/// Returns `None` for topics outside the device subtree.
pub fn strip_root<'a>(topic: &'a str, root: &str) -> Option<&'a str> {
    let relative = topic.strip_prefix(root)?;
    if relative.starts_with('/') {
        Some(relative)
    } else {
        None
    }
}

/// Split `/{interface}/{rest}` at the second slash into `(interface, "/{rest}")`.
///
/// A target with no path after the interface yields an empty path.
pub fn split_target(target: &str) -> Option<(&str, &str)> {
    let without_slash = target.strip_prefix('/')?;
    match without_slash.find('/') {
        Some(index) => {
            let (interface, path) = without_slash.split_at(index);
            (!interface.is_empty()).then_some((interface, path))
        }
        None => (!without_slash.is_empty()).then_some((without_slash, "")),
    }
}

/// Mapping paths must start with `/` and contain no empty or wildcard segments.
pub fn is_valid_path(path: &str) -> bool {
    match path.strip_prefix('/') {
        Some(rest) => !rest.is_empty() && rest.split('/').all(is_valid_segment),
        None => false,
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(|c: char| c == '#' || c == '+')
}

/// Introspection string: `name:major:minor` entries joined by `;`.
pub fn introspection_payload<'a, I>(interfaces: I) -> String
where
    I: IntoIterator<Item = (&'a str, u32, u32)>,
{
    interfaces
        .into_iter()
        .map(|(name, major, minor)| format!("{name}:{major}:{minor}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Producer properties payload.
///
/// Targets lose their leading `/`, are joined by `;` and compressed as a
/// big-endian `u32` uncompressed length followed by a zlib stream.
pub fn producer_properties_payload<'a, I>(targets: I) -> io::Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a str>,
{
    let list = targets
        .into_iter()
        .map(|target| target.strip_prefix('/').unwrap_or(target))
        .collect::<Vec<_>>()
        .join(";");

    let length = u32::try_from(list.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "property list too large"))?;

    let mut payload = length.to_be_bytes().to_vec();
    let mut encoder = ZlibEncoder::new(&mut payload, Compression::default());
    encoder.write_all(list.as_bytes())?;
    encoder.finish()?;
    Ok(payload)
}

/// Inverse of [`producer_properties_payload`], as used by the broker side.
pub fn decode_producer_properties(payload: &[u8]) -> io::Result<Vec<String>> {
    if payload.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "missing length prefix",
        ));
    }
    let (length, compressed) = payload.split_at(4);
    let expected = u32::from_be_bytes([length[0], length[1], length[2], length[3]]) as usize;

    let mut list = String::with_capacity(expected);
    ZlibDecoder::new(compressed).read_to_string(&mut list)?;
    if list.len() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "length prefix does not match content",
        ));
    }

    Ok(if list.is_empty() {
        Vec::new()
    } else {
        list.split(';').map(str::to_string).collect()
    })
}
