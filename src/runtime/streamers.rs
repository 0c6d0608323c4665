//! Streamer creation and graph wiring
//!
//! Turns a [`Topology`] into rx/tx endpoints according to a channel-grouping
//! policy, connects them, and commits the graph.

use super::errors::StreamerError;
use super::replay::{REPLAY_WORD_SIZE, samples_per_word};
use super::topology::{BlockPort, Topology};
use crate::ArchError;
use crate::config::SampleFormat;
use crate::driver::{DriverError, Graph, Node, PortRef, RxStream, StreamArgs, TxStream};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How channels are spread across streamers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelGrouping {
    /// One streamer carrying every channel
    Single,
    /// One streamer per physical device
    PerDevice,
    /// One streamer per channel
    PerChannel,
}

impl FromStr for ChannelGrouping {
    type Err = ArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ChannelGrouping::Single),
            "per-device" => Ok(ChannelGrouping::PerDevice),
            "per-channel" => Ok(ChannelGrouping::PerChannel),
            other => Err(ArchError::InvalidConfig(format!("unknown channel grouping '{}'", other))),
        }
    }
}

/// Receive endpoint with the radio channels it carries, in streamer-port order
#[derive(Clone)]
pub struct RxEndpoint {
    pub stream: Arc<dyn RxStream>,
    pub channels: Vec<usize>,
    pub max_samps: usize,
}

/// Transmit endpoint; `replay` is set when it feeds replay memory instead of a radio
#[derive(Clone)]
pub struct TxEndpoint {
    pub stream: Arc<dyn TxStream>,
    pub channels: Vec<usize>,
    pub max_samps: usize,
    pub replay: Option<BlockPort>,
}

/// What the transmit side of a run needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxRequest {
    None,
    /// Host streams samples straight to the radios
    Host {
        grouping: ChannelGrouping,
        channels: Vec<usize>,
    },
    /// Host loads replay memory, which then plays out to the listed channels
    Replay { channels: Vec<usize> },
}

#[derive(Debug, Clone)]
pub struct StreamerRequest {
    pub rx_grouping: ChannelGrouping,
    pub rx_channels: Vec<usize>,
    pub tx: TxRequest,
    pub format: SampleFormat,
    pub otw: String,
    pub extra_args: String,
}

#[derive(Clone, Default)]
pub struct Streamers {
    pub rx: Vec<RxEndpoint>,
    pub tx: Vec<TxEndpoint>,
}

/// Split `channels` into streamer groups, preserving order within a group
pub fn group_channels(grouping: ChannelGrouping, topology: &Topology, channels: &[usize]) -> Vec<Vec<usize>> {
    match grouping {
        ChannelGrouping::Single => {
            if channels.is_empty() {
                Vec::new()
            } else {
                vec![channels.to_vec()]
            }
        }
        ChannelGrouping::PerChannel => channels.iter().map(|&ch| vec![ch]).collect(),
        ChannelGrouping::PerDevice => {
            let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
            for &ch in channels {
                let device = topology.channels[ch].radio.device;
                match groups.iter_mut().find(|(d, _)| *d == device) {
                    Some((_, group)) => group.push(ch),
                    None => groups.push((device, vec![ch])),
                }
            }
            groups.into_iter().map(|(_, group)| group).collect()
        }
    }
}

pub struct StreamerFactory<'a> {
    graph: &'a dyn Graph,
    topology: &'a Topology,
    format: SampleFormat,
    otw: String,
    extra_args: String,
}

impl<'a> StreamerFactory<'a> {
    pub fn new(graph: &'a dyn Graph, topology: &'a Topology, format: SampleFormat, otw: &str) -> Self {
        Self {
            graph,
            topology,
            format,
            otw: otw.to_string(),
            extra_args: String::new(),
        }
    }

    pub fn with_extra_args(mut self, extra_args: &str) -> Self {
        self.extra_args = extra_args.to_string();
        self
    }

    fn stream_args(&self) -> StreamArgs {
        let mut args = StreamArgs::new(self.format, self.otw.clone());
        args.extra = self.extra_args.clone();
        args
    }

    fn connect(&self, src: PortRef, dst: PortRef) -> Result<(), StreamerError> {
        debug!("Connecting {} ==> {}", src, dst);
        self.graph.connect(&src, &dst).map_err(|source| StreamerError::Connect {
            from: src.to_string(),
            to: dst.to_string(),
            source,
        })
    }

    fn check_channels(&self, channels: &[usize], direction: &'static str) -> Result<(), StreamerError> {
        if let Some(&bad) = channels.iter().find(|&&ch| ch >= self.topology.num_channels()) {
            return Err(StreamerError::StreamerCreateError {
                direction,
                channels: channels.len(),
                source: DriverError::Rejected(format!("no radio channel {}", bad)),
            });
        }
        Ok(())
    }

    /// Create rx streamers and connect each channel's rx source to them
    pub fn create_rx(&self, grouping: ChannelGrouping, channels: &[usize]) -> Result<Vec<RxEndpoint>, StreamerError> {
        self.check_channels(channels, "rx")?;
        let mut endpoints = Vec::new();
        for group in group_channels(grouping, self.topology, channels) {
            let stream = self
                .graph
                .create_rx_streamer(group.len(), &self.stream_args())
                .map_err(|source| StreamerError::StreamerCreateError {
                    direction: "rx",
                    channels: group.len(),
                    source,
                })?;
            for (port, &ch) in group.iter().enumerate() {
                self.connect(
                    self.topology.channels[ch].rx_source().port_ref(),
                    PortRef {
                        node: Node::RxStreamer(stream.id()),
                        port,
                    },
                )?;
            }
            let max_samps = stream.max_num_samps();
            info!("rx {} carries channels {:?}, max {} samples per transfer", stream.id(), group, max_samps);
            endpoints.push(RxEndpoint {
                stream,
                channels: group,
                max_samps,
            });
        }
        Ok(endpoints)
    }

    /// Create host tx streamers feeding the radios directly
    pub fn create_host_tx(&self, grouping: ChannelGrouping, channels: &[usize]) -> Result<Vec<TxEndpoint>, StreamerError> {
        self.check_channels(channels, "tx")?;
        let mut endpoints = Vec::new();
        for group in group_channels(grouping, self.topology, channels) {
            let stream = self
                .graph
                .create_tx_streamer(group.len(), &self.stream_args())
                .map_err(|source| StreamerError::StreamerCreateError {
                    direction: "tx",
                    channels: group.len(),
                    source,
                })?;
            for (port, &ch) in group.iter().enumerate() {
                self.connect(
                    PortRef {
                        node: Node::TxStreamer(stream.id()),
                        port,
                    },
                    self.topology.channels[ch].tx_sink().port_ref(),
                )?;
            }
            let max_samps = stream.max_num_samps();
            info!("tx {} carries channels {:?}, max {} samples per transfer", stream.id(), group, max_samps);
            endpoints.push(TxEndpoint {
                stream,
                channels: group,
                max_samps,
                replay: None,
            });
        }
        Ok(endpoints)
    }

    /// Create one tx streamer per replay block, feeding the record input of
    /// its first port. The transfer unit is rounded down to whole replay
    /// words, recreating the streamer when rounding changed it.
    pub fn create_replay_tx(&self) -> Result<Vec<TxEndpoint>, StreamerError> {
        let spw = samples_per_word(self.format).map_err(|e| StreamerError::StreamerCreateError {
            direction: "tx",
            channels: 1,
            source: DriverError::Rejected(e.to_string()),
        })?;

        let mut endpoints = Vec::new();
        for (index, target) in self.topology.replays.iter().enumerate().step_by(2) {
            let create = |args: &StreamArgs| {
                self.graph
                    .create_tx_streamer(1, args)
                    .map_err(|source| StreamerError::StreamerCreateError {
                        direction: "tx",
                        channels: 1,
                        source,
                    })
            };
            let mut args = self.stream_args();
            args.block_id = Some(target.block.clone());
            args.block_port = Some(target.port);

            let mut stream = create(&args)?;
            let max = stream.max_num_samps();
            let rounded = max - max % spw;
            if rounded != max {
                warn!(
                    "{}: {} samples per packet is not a multiple of the {}-byte replay word, recreating with {}",
                    target, max, REPLAY_WORD_SIZE, rounded
                );
                args.spp = Some(rounded);
                stream = create(&args)?;
            }

            self.connect(
                PortRef {
                    node: Node::TxStreamer(stream.id()),
                    port: 0,
                },
                target.port_ref(),
            )?;
            let max_samps = stream.max_num_samps();
            endpoints.push(TxEndpoint {
                stream,
                channels: vec![index],
                max_samps,
                replay: Some(target.clone()),
            });
        }
        Ok(endpoints)
    }

    /// Connect replay outputs to the radios of `channels`
    pub fn wire_replay_playback(&self, channels: &[usize]) -> Result<(), StreamerError> {
        for &ch in channels {
            let Some(replay) = self.topology.replay_for(ch) else {
                return Err(StreamerError::Connect {
                    from: format!("replay for channel {}", ch),
                    to: self.topology.channels.get(ch).map(|c| c.radio.to_string()).unwrap_or_default(),
                    source: DriverError::NotFound("replay port".to_string()),
                });
            };
            let Some(path) = self.topology.channels.get(ch) else {
                continue;
            };
            self.connect(replay.port_ref(), path.tx_sink().port_ref())?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StreamerError> {
        self.graph.commit().map_err(StreamerError::Commit)
    }
}

/// Build every endpoint a run needs, wire them, and commit the graph
pub fn create_streamers(
    graph: &dyn Graph,
    topology: &Topology,
    request: &StreamerRequest,
) -> Result<Streamers, StreamerError> {
    let factory =
        StreamerFactory::new(graph, topology, request.format, &request.otw).with_extra_args(&request.extra_args);

    let rx = factory.create_rx(request.rx_grouping, &request.rx_channels)?;
    let tx = match &request.tx {
        TxRequest::None => Vec::new(),
        TxRequest::Host { grouping, channels } => factory.create_host_tx(*grouping, channels)?,
        TxRequest::Replay { channels } => {
            let tx = factory.create_replay_tx()?;
            factory.wire_replay_playback(channels)?;
            tx
        }
    };

    factory.commit()?;
    info!("Active connections committed: {} rx, {} tx endpoints", rx.len(), tx.len());
    Ok(Streamers { rx, tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::{SimConfig, SimGraph};

    fn setup(devices: usize) -> (Arc<SimGraph>, Topology) {
        let graph = SimGraph::new(SimConfig {
            devices,
            ..SimConfig::default()
        });
        let topology = Topology::discover(graph.as_ref()).unwrap();
        (graph, topology)
    }

    fn request(grouping: ChannelGrouping, channels: Vec<usize>, tx: TxRequest) -> StreamerRequest {
        StreamerRequest {
            rx_grouping: grouping,
            rx_channels: channels,
            tx,
            format: SampleFormat::Sc16,
            otw: "sc16".to_string(),
            extra_args: String::new(),
        }
    }

    #[test]
    fn test_every_grouping_covers_all_radios() {
        for grouping in [ChannelGrouping::Single, ChannelGrouping::PerDevice, ChannelGrouping::PerChannel] {
            let (graph, topology) = setup(2);
            let all: Vec<usize> = (0..topology.num_channels()).collect();
            let streamers = create_streamers(graph.as_ref(), &topology, &request(grouping, all, TxRequest::None)).unwrap();
            let covered: usize = streamers.rx.iter().map(|e| e.stream.num_channels()).sum();
            assert_eq!(covered, topology.num_channels(), "{:?}", grouping);
            assert!(graph.is_committed());
        }
    }

    #[test]
    fn test_per_device_grouping_pairs_channels() {
        let (_graph, topology) = setup(2);
        let groups = group_channels(ChannelGrouping::PerDevice, &topology, &[0, 1, 2, 3]);
        assert_eq!(groups, vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(group_channels(ChannelGrouping::Single, &topology, &[]), Vec::<Vec<usize>>::new());
    }

    #[test]
    fn test_replay_tx_rounds_to_word_and_recreates() {
        let (graph, topology) = setup(2);
        let streamers = create_streamers(
            graph.as_ref(),
            &topology,
            &request(ChannelGrouping::Single, vec![0, 1, 2, 3], TxRequest::Replay { channels: vec![0, 1, 2, 3] }),
        )
        .unwrap();
        assert_eq!(streamers.tx.len(), 2);
        for tx in &streamers.tx {
            assert_eq!(tx.max_samps, 1998);
            assert_eq!(tx.replay.as_ref().unwrap().port, 0);
        }
        // Replay outputs wired to every converter input
        let to_duc = graph
            .connections()
            .iter()
            .filter(|(src, dst)| {
                matches!(&src.node, Node::Block(b) if b.matches("Replay"))
                    && matches!(&dst.node, Node::Block(b) if b.matches("DUC"))
            })
            .count();
        assert_eq!(to_duc, 4);
    }

    #[test]
    fn test_replay_tx_keeps_aligned_transfer_unit() {
        let graph = SimGraph::new(SimConfig {
            max_samps_per_packet: 2000,
            ..SimConfig::default()
        });
        let topology = Topology::discover(graph.as_ref()).unwrap();
        let factory = StreamerFactory::new(graph.as_ref(), &topology, SampleFormat::Sc16, "sc16");
        let tx = factory.create_replay_tx().unwrap();
        assert_eq!(tx[0].max_samps, 2000);
        assert_eq!(tx[0].stream.id().0, 0);
    }

    #[test]
    fn test_rejects_unknown_channel() {
        let (graph, topology) = setup(1);
        let result = create_streamers(
            graph.as_ref(),
            &topology,
            &request(ChannelGrouping::PerChannel, vec![5], TxRequest::None),
        );
        assert!(matches!(result, Err(StreamerError::StreamerCreateError { .. })));
    }

    #[test]
    fn test_host_tx_connects_to_up_converters() {
        let (graph, topology) = setup(1);
        let streamers = create_streamers(
            graph.as_ref(),
            &topology,
            &request(
                ChannelGrouping::PerChannel,
                vec![0, 1],
                TxRequest::Host {
                    grouping: ChannelGrouping::PerChannel,
                    channels: vec![0, 1],
                },
            ),
        )
        .unwrap();
        assert_eq!(streamers.tx.len(), 2);
        let tx_links = graph
            .connections()
            .iter()
            .filter(|(src, _)| matches!(src.node, Node::TxStreamer(_)))
            .count();
        assert_eq!(tx_links, 2);
    }
}
