//! Partition identities and segment descriptors.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Write};

use crate::time::{Interval, format_millis};

/// Identifies one logical partition: a data source, a time interval, a
/// version and a shard number. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionIdentity {
    data_source: String,
    interval: Interval,
    version: String,
    shard: u32,
}

impl PartitionIdentity {
    pub fn new(
        data_source: impl Into<String>,
        interval: Interval,
        version: impl Into<String>,
        shard: u32,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            interval,
            version: version.into(),
            shard,
        }
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Returns the descriptor that addresses this partition in queries.
    pub fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor::new(self.interval, self.version.clone(), self.shard)
    }

    /// Filesystem-safe, lossless directory name for this identity.
    ///
    /// This name is also the key under which the commit record tracks the
    /// identity.
    pub fn dir_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            escape_path_part(&self.data_source),
            self.interval.start(),
            self.interval.end(),
            escape_path_part(&self.version),
            self.shard
        )
    }
}

impl Ord for PartitionIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.interval
            .start()
            .cmp(&other.interval.start())
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.shard.cmp(&other.shard))
            .then_with(|| self.interval.end().cmp(&other.interval.end()))
            .then_with(|| self.data_source.cmp(&other.data_source))
    }
}

impl PartialOrd for PartitionIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PartitionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.data_source,
            format_millis(self.interval.start()),
            format_millis(self.interval.end()),
            self.version
        )?;
        if self.shard != 0 {
            write!(f, "_{}", self.shard)?;
        }
        Ok(())
    }
}

/// Escapes everything except ASCII alphanumerics, `-` and `.` as `%xx`.
fn escape_path_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for byte in part.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            out.push(byte as char);
        } else {
            let _ = write!(&mut out, "%{:02x}", byte);
        }
    }
    out
}

/// Addresses a partition, or a time slice of one, by interval, version and
/// shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub interval: Interval,
    pub version: String,
    pub shard: u32,
}

impl SegmentDescriptor {
    pub fn new(interval: Interval, version: impl Into<String>, shard: u32) -> Self {
        Self {
            interval,
            version: version.into(),
            shard,
        }
    }

    /// True when the descriptor addresses `identity`: same version and
    /// shard, and an interval overlapping the identity's interval.
    pub fn addresses(&self, identity: &PartitionIdentity) -> bool {
        identity.version == self.version
            && identity.shard == self.shard
            && identity.interval.overlaps(&self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(text: &str) -> Interval {
        text.parse().unwrap()
    }

    #[test]
    fn test_identity_ordering() {
        let a = PartitionIdentity::new("ds", interval("2000/2001"), "A", 0);
        let b = PartitionIdentity::new("ds", interval("2000/2001"), "A", 1);
        let c = PartitionIdentity::new("ds", interval("2001/2002"), "A", 0);
        let d = PartitionIdentity::new("ds", interval("2000/2001"), "B", 0);

        let mut ids = vec![c.clone(), d.clone(), b.clone(), a.clone()];
        ids.sort();
        assert_eq!(ids, vec![a, b, d, c]);
    }

    #[test]
    fn test_dir_name_is_escaped() {
        let id = PartitionIdentity::new("my_ds/x", interval("2000/2001"), "v 1", 3);
        let name = id.dir_name();
        assert!(!name.contains('/'));
        assert!(!name.contains(' '));
        assert!(name.starts_with("my%5fds%2fx_"));
        assert!(name.ends_with("_v%201_3"));
    }

    #[test]
    fn test_descriptor_addresses_sub_interval() {
        let id = PartitionIdentity::new("ds", interval("2001/2002"), "A", 0);
        let slice = SegmentDescriptor::new(interval("2001/PT1H"), "A", 0);
        assert!(slice.addresses(&id));

        let other_shard = SegmentDescriptor::new(interval("2001/PT1H"), "A", 1);
        assert!(!other_shard.addresses(&id));

        let other_time = SegmentDescriptor::new(interval("2003/PT1H"), "A", 0);
        assert!(!other_time.addresses(&id));
    }

    #[test]
    fn test_display() {
        let id = PartitionIdentity::new("foo", interval("2000/2001"), "A", 0);
        assert_eq!(
            id.to_string(),
            "foo_2000-01-01T00:00:00.000Z_2001-01-01T00:00:00.000Z_A"
        );
    }
}
