//! Topology discovery
//!
//! Enumerates radio, converter, and replay blocks, puts every list into
//! canonical order so index `i` in one list refers to the same physical
//! channel as index `i` in another, and classifies converters by walking the
//! static connection graph.

use super::errors::TopologyError;
use crate::config::DeviceArgs;
use crate::driver::{BlockId, Driver, DriverError, Graph, GraphEdge, PortRef};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub const RADIO_BLOCK: &str = "Radio";
pub const DOWN_CONVERTER_BLOCK: &str = "DDC";
pub const UP_CONVERTER_BLOCK: &str = "DUC";
pub const REPLAY_BLOCK: &str = "Replay";

/// Radio port that carries the channel in both directions
const RADIO_PORT: usize = 0;
/// Ports exposed by each replay block
const REPLAY_PORTS: usize = 2;

/// A (device, block, port) triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPort {
    pub block: BlockId,
    pub port: usize,
}

impl BlockPort {
    pub fn new(block: BlockId, port: usize) -> Self {
        Self { block, port }
    }

    pub fn device(&self) -> usize {
        self.block.device
    }

    pub fn port_ref(&self) -> PortRef {
        PortRef::block(self.block.clone(), self.port)
    }
}

impl fmt::Display for BlockPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.port)
    }
}

/// Everything between one radio and its streamers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPath {
    pub radio: BlockId,
    /// Converter fed by the radio's output port
    pub down_converter: Option<BlockPort>,
    /// Converter feeding the radio's input port
    pub up_converter: Option<BlockPort>,
}

impl ChannelPath {
    /// Port an rx streamer attaches to
    pub fn rx_source(&self) -> BlockPort {
        self.down_converter
            .clone()
            .unwrap_or_else(|| BlockPort::new(self.radio.clone(), RADIO_PORT))
    }

    /// Port a tx streamer or replay output attaches to
    pub fn tx_sink(&self) -> BlockPort {
        self.up_converter
            .clone()
            .unwrap_or_else(|| BlockPort::new(self.radio.clone(), RADIO_PORT))
    }
}

/// Discovered structure of one session
#[derive(Debug, Clone)]
pub struct Topology {
    pub channels: Vec<ChannelPath>,
    /// One entry per replay port: each replay block appears once per port,
    /// so entry `i` is the replay path of radio channel `i`
    pub replays: Vec<BlockPort>,
    /// Static radio/converter edges the paths were derived from
    pub edges: Vec<GraphEdge>,
    pub num_devices: usize,
}

/// Open the device session and discover its topology
pub fn discover(driver: &dyn Driver, args: &DeviceArgs) -> Result<(Arc<dyn Graph>, Topology), TopologyError> {
    info!("Creating the device session with: {}...", args);
    let graph = driver.open(args).map_err(|e| match e {
        DriverError::NotFound(what) => TopologyError::DeviceNotFound(what),
        other => TopologyError::Driver(other),
    })?;
    let topology = Topology::discover(graph.as_ref())?;
    Ok((graph, topology))
}

impl Topology {
    pub fn discover(graph: &dyn Graph) -> Result<Self, TopologyError> {
        let mut radios = graph.find_blocks(RADIO_BLOCK);
        radios.sort();
        if radios.is_empty() {
            return Err(TopologyError::MissingBlocks("no radio blocks".to_string()));
        }

        let static_edges = graph.static_connections();
        let mut edges = Vec::new();
        let mut channels = Vec::with_capacity(radios.len());

        for radio in &radios {
            let downs: Vec<&GraphEdge> = static_edges
                .iter()
                .filter(|e| {
                    &e.src_block == radio && e.src_port == RADIO_PORT && e.dst_block.matches(DOWN_CONVERTER_BLOCK)
                })
                .collect();
            let ups: Vec<&GraphEdge> = static_edges
                .iter()
                .filter(|e| {
                    &e.dst_block == radio && e.dst_port == RADIO_PORT && e.src_block.matches(UP_CONVERTER_BLOCK)
                })
                .collect();

            if downs.len() > 1 || ups.len() > 1 {
                return Err(TopologyError::MissingBlocks(format!(
                    "{} has {} down and {} up converter edges",
                    radio,
                    downs.len(),
                    ups.len()
                )));
            }

            let down_converter = downs
                .first()
                .map(|e| BlockPort::new(e.dst_block.clone(), e.dst_port));
            let up_converter = ups.first().map(|e| BlockPort::new(e.src_block.clone(), e.src_port));
            edges.extend(downs.into_iter().cloned());
            edges.extend(ups.into_iter().cloned());

            debug!(
                "{}: down converter {:?}, up converter {:?}",
                radio,
                down_converter.as_ref().map(|p| p.to_string()),
                up_converter.as_ref().map(|p| p.to_string())
            );
            channels.push(ChannelPath {
                radio: radio.clone(),
                down_converter,
                up_converter,
            });
        }

        // Converters are all-or-nothing; a partial image cannot be wired uniformly.
        let with_down = channels.iter().filter(|c| c.down_converter.is_some()).count();
        let with_up = channels.iter().filter(|c| c.up_converter.is_some()).count();
        for (kind, count) in [(DOWN_CONVERTER_BLOCK, with_down), (UP_CONVERTER_BLOCK, with_up)] {
            if count != 0 && count != channels.len() {
                return Err(TopologyError::MissingBlocks(format!(
                    "{} of {} radios have a {} block",
                    count,
                    channels.len(),
                    kind
                )));
            }
        }

        let mut replay_blocks = graph.find_blocks(REPLAY_BLOCK);
        replay_blocks.sort();
        let replays = replay_blocks
            .iter()
            .flat_map(|block| (0..REPLAY_PORTS).map(move |port| BlockPort::new(block.clone(), port)))
            .collect::<Vec<_>>();

        info!(
            "Discovered {} radio channels on {} devices ({} converters, {} replay ports)",
            channels.len(),
            graph.num_mboards(),
            if with_down == 0 { "no" } else { "with" },
            replays.len()
        );

        Ok(Self {
            channels,
            replays,
            edges,
            num_devices: graph.num_mboards(),
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn has_converters(&self) -> bool {
        self.channels.iter().any(|c| c.down_converter.is_some() || c.up_converter.is_some())
    }

    /// Replay port paired with radio channel `channel`
    pub fn replay_for(&self, channel: usize) -> Option<&BlockPort> {
        self.replays.get(channel)
    }

    /// Distinct replay blocks, one per physical buffer
    pub fn replay_blocks(&self) -> Vec<BlockId> {
        self.replays
            .iter()
            .step_by(REPLAY_PORTS)
            .map(|p| p.block.clone())
            .collect()
    }
}
