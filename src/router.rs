//! Flow routing and interface-channel reuse
//!
//! The flow table keeps one circuit-switched flow per (outbound, inbound)
//! channel pair. The reuse index remembers which bundles touched which
//! channels so a bundle can ride an interface channel an earlier bundle
//! already opened toward the same endpoint.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::bundle::FlowBundle;
use crate::device::{ChannelKey, Direction};
use crate::error::{CompileError, CompileResult};

/// A stream connection between two channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Flow {
    pub source: ChannelKey,
    pub dest: ChannelKey,
}

#[derive(Debug, Clone, Default)]
pub struct FlowRouter {
    flows: Vec<Flow>,
    index: HashMap<(ChannelKey, ChannelKey), usize>,
    by_consumer: BTreeMap<ChannelKey, Vec<usize>>,
    by_producer: BTreeMap<ChannelKey, Vec<usize>>,
}

impl FlowRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect an outbound channel to an inbound one. Connecting the same
    /// pair again returns the existing flow.
    pub fn connect(&mut self, source: ChannelKey, dest: ChannelKey) -> CompileResult<usize> {
        if source.direction != Direction::Outbound || dest.direction != Direction::Inbound {
            return Err(CompileError::codegen(format!(
                "flow must run from an outbound to an inbound channel, got {} -> {}",
                source, dest
            )));
        }
        if source.tile == dest.tile {
            return Err(CompileError::unsupported_path(source.to_string(), dest.to_string()));
        }
        if let Some(existing) = self.index.get(&(source, dest)) {
            return Ok(*existing);
        }
        let id = self.flows.len();
        self.flows.push(Flow { source, dest });
        self.index.insert((source, dest), id);
        debug!(%source, %dest, "connected flow");
        Ok(id)
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// Index the channels `bundle` holds so far. Safe to call repeatedly.
    pub fn record(&mut self, index: usize, bundle: &FlowBundle) {
        if let Some(key) = bundle.producer_alloc {
            let entry = self.by_producer.entry(key).or_default();
            if !entry.contains(&index) {
                entry.push(index);
            }
        }
        for key in bundle.consumer_keys() {
            let entry = self.by_consumer.entry(key).or_default();
            if !entry.contains(&index) {
                entry.push(index);
            }
        }
    }

    /// Look for an interface channel an earlier bundle opened that can serve
    /// a bundle anchored on `anchors`.
    ///
    /// `need` is the direction the interface channel must have. For an
    /// outbound channel, bundles feeding one of the anchors are searched for
    /// their producer channel; for an inbound one, bundles fed by the anchor
    /// are searched for a consumer channel. `eligible` filters candidates.
    pub fn find_reuse(
        &self,
        bundles: &[FlowBundle],
        anchors: &[ChannelKey],
        need: Direction,
        eligible: impl Fn(&ChannelKey) -> bool,
    ) -> Option<ChannelKey> {
        let index = match need {
            Direction::Outbound => &self.by_consumer,
            Direction::Inbound => &self.by_producer,
        };
        for anchor in anchors {
            let Some(users) = index.get(anchor) else {
                continue;
            };
            for bundle in users.iter().filter_map(|u| bundles.get(*u)) {
                let candidates: Vec<ChannelKey> = match need {
                    Direction::Outbound => bundle.producer_alloc.into_iter().collect(),
                    Direction::Inbound => bundle.consumer_keys().collect(),
                };
                if let Some(key) = candidates
                    .into_iter()
                    .find(|k| k.direction == need && eligible(k))
                {
                    return Some(key);
                }
            }
        }
        None
    }
}
