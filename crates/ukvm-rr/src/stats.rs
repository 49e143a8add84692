//! Per-call-site summary of a record/replay log.

use crate::log::{LogError, LogReader, HEADER_SIZE};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SiteStats {
    pub entries: u64,
    pub payload_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub entries: u64,
    /// Uncompressed log size, headers included.
    pub raw_bytes: u64,
    pub sites: BTreeMap<String, SiteStats>,
}

impl LogStats {
    /// Read the whole log and tally entries per call site.
    pub fn collect<R: Read>(reader: &mut LogReader<R>) -> Result<Self, LogError> {
        let mut stats = LogStats::default();
        while let Some(entry) = reader.next_entry()? {
            let len = entry.payload.len() as u64;
            stats.entries += 1;
            stats.raw_bytes += HEADER_SIZE as u64 + len;
            let site = stats.sites.entry(entry.site).or_default();
            site.entries += 1;
            site.payload_bytes += len;
        }
        Ok(stats)
    }
}
