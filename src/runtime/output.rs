//! Output naming and per-channel file multiplexing

use super::errors::{NamingError, WorkError, WorkResult};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Channel index to destination directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationTable {
    dirs: BTreeMap<usize, PathBuf>,
    fallback: Option<PathBuf>,
}

impl LocationTable {
    /// Build from two parallel lists. Entry `i` of `channels` names the
    /// channel indices (whitespace or comma separated) stored under
    /// `locations[i]`.
    pub fn parse(channels: &[String], locations: &[PathBuf]) -> Result<Self, NamingError> {
        if channels.len() != locations.len() {
            return Err(NamingError::ConfigMismatch {
                channels: channels.len(),
                locations: locations.len(),
            });
        }
        let mut dirs = BTreeMap::new();
        for (list, dir) in channels.iter().zip(locations) {
            for token in list.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty()) {
                let channel = token
                    .parse::<usize>()
                    .map_err(|_| NamingError::InvalidChannelList(list.clone()))?;
                dirs.insert(channel, dir.clone());
            }
        }
        Ok(Self { dirs, fallback: None })
    }

    /// Every channel maps to `dir`
    pub fn single(dir: impl Into<PathBuf>) -> Self {
        Self {
            dirs: BTreeMap::new(),
            fallback: Some(dir.into()),
        }
    }

    pub fn dir_for(&self, channel: usize) -> Result<&Path, NamingError> {
        self.dirs
            .get(&channel)
            .or(self.fallback.as_ref())
            .map(PathBuf::as_path)
            .ok_or(NamingError::UnmappedChannel(channel))
    }
}

/// Frequency-tagged subfolder, e.g. `CW_2.400000_GHz_<folder>`
fn frequency_folder(frequency: f64, folder_name: &str) -> String {
    format!("CW_{:.6}_GHz_{}", frequency * 1e-9, folder_name)
}

/// Deterministic output path of one (channel, tx channel, run) tuple
pub fn filename_for(
    base: &str,
    channel: usize,
    tx_channel: usize,
    run: usize,
    frequency: f64,
    folder_name: &str,
    table: &LocationTable,
) -> Result<PathBuf, NamingError> {
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (base, None),
    };
    let mut file = format!(
        "{}.tx_{:02}_rx_{:02}_run_{:02}_cw_{:.0}",
        stem, tx_channel, channel, run, frequency
    );
    if let Some(ext) = ext {
        file.push('.');
        file.push_str(ext);
    }
    Ok(table
        .dir_for(channel)?
        .join(frequency_folder(frequency, folder_name))
        .join(file))
}

/// Naming inputs shared by every worker of a run
#[derive(Debug, Clone)]
pub struct OutputNaming {
    pub base: String,
    pub frequency: f64,
    pub folder_name: String,
    pub table: LocationTable,
}

impl OutputNaming {
    /// Same naming with files tagged for `frequency`
    pub fn at_frequency(&self, frequency: f64) -> Self {
        Self {
            frequency,
            ..self.clone()
        }
    }

    pub fn path_for(&self, channel: usize, tx_channel: usize, run: usize) -> Result<PathBuf, NamingError> {
        filename_for(
            &self.base,
            channel,
            tx_channel,
            run,
            self.frequency,
            &self.folder_name,
            &self.table,
        )
    }
}

/// Buffered output files of one worker, one per channel, opened on first write
pub struct ChannelWriters {
    paths: Vec<PathBuf>,
    files: Vec<Option<BufWriter<File>>>,
    bytes: Vec<u64>,
}

impl ChannelWriters {
    /// Resolve every path up front so naming errors surface before streaming
    pub fn new(naming: &OutputNaming, channels: &[usize], tx_channel: usize, run: usize) -> Result<Self, NamingError> {
        let paths = channels
            .iter()
            .map(|&ch| naming.path_for(ch, tx_channel, run))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            files: paths.iter().map(|_| None).collect(),
            bytes: vec![0; paths.len()],
            paths,
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn bytes_written(&self, index: usize) -> u64 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    /// Append `data` to the file of the `index`-th channel
    pub fn write(&mut self, index: usize, data: &[u8]) -> WorkResult {
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| WorkError::ReceiverError(format!("no output file for stream port {}", index)))?;
        let slot = &mut self.files[index];
        if slot.is_none() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!("Opening {}", path.display());
            *slot = Some(BufWriter::new(File::create(path)?));
        }
        if let Some(writer) = slot {
            writer.write_all(data)?;
        }
        self.bytes[index] += data.len() as u64;
        Ok(())
    }

    /// Flush and close every opened file
    pub fn close(&mut self) -> WorkResult {
        for (path, slot) in self.paths.iter().zip(self.files.iter_mut()) {
            if let Some(mut writer) = slot.take() {
                writer.flush()?;
                info!("Wrote {}", path.display());
            }
        }
        Ok(())
    }
}

impl Drop for ChannelWriters {
    fn drop(&mut self) {
        for writer in self.files.iter_mut().flatten() {
            let _ = writer.flush();
        }
    }
}
