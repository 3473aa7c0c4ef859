use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::Error;

/// The local VIP membership sink.
///
/// Three operations are all the reconciler needs: claim a slot, release a
/// slot, and read back the currently claimed set for diagnostics. The
/// reconciler is the only writer; `query` is read-only.
#[async_trait]
pub trait VipSink: Send {
    async fn add(&mut self, slot: usize) -> Result<(), Error>;
    async fn remove(&mut self, slot: usize) -> Result<(), Error>;
    async fn query(&mut self) -> Result<BTreeSet<usize>, Error>;
}

/// Sink backed by a kernel CLUSTERIP-style control file.
///
/// The kernel exposes one pseudo-file per vip; writing `+<id>` claims a slot
/// for the local node and `-<id>` releases it. Reading the file returns the
/// comma-separated list of currently claimed slots.
pub struct ClusterIpFile {
    path: PathBuf,
}

impl ClusterIpFile {
    pub fn new(dir: impl AsRef<Path>, vip: &str) -> Self {
        Self {
            path: dir.as_ref().join(vip),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_directive(&self, directive: String) -> Result<(), Error> {
        tokio::fs::write(&self.path, directive.as_bytes())
            .await
            .map_err(Error::SinkWrite)
    }
}

#[async_trait]
impl VipSink for ClusterIpFile {
    async fn add(&mut self, slot: usize) -> Result<(), Error> {
        tracing::debug!(slot, path = %self.path.display(), "claiming slot");
        self.write_directive(format!("+{slot}\n")).await
    }

    async fn remove(&mut self, slot: usize) -> Result<(), Error> {
        tracing::debug!(slot, path = %self.path.display(), "releasing slot");
        self.write_directive(format!("-{slot}\n")).await
    }

    async fn query(&mut self) -> Result<BTreeSet<usize>, Error> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(Error::SinkWrite(err)),
        };
        Ok(parse_slot_list(&contents))
    }
}

/// The kernel prints claimed slots as a separated number list; be liberal
/// about the separators.
fn parse_slot_list(contents: &str) -> BTreeSet<usize> {
    contents
        .split(|c: char| !c.is_ascii_digit())
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| chunk.parse().ok())
        .collect()
}

/// A single sink operation, recorded by [`MemorySink`] for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOp {
    Add(usize),
    Remove(usize),
}

/// In-memory sink used by tests and dry runs. Keeps an ordered log of every
/// operation issued against it.
#[derive(Debug, Default)]
pub struct MemorySink {
    slots: BTreeSet<usize>,
    ops: Vec<SinkOp>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slots(&self) -> &BTreeSet<usize> {
        &self.slots
    }

    pub fn ops(&self) -> &[SinkOp] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }
}

#[async_trait]
impl VipSink for MemorySink {
    async fn add(&mut self, slot: usize) -> Result<(), Error> {
        self.slots.insert(slot);
        self.ops.push(SinkOp::Add(slot));
        Ok(())
    }

    async fn remove(&mut self, slot: usize) -> Result<(), Error> {
        self.slots.remove(&slot);
        self.ops.push(SinkOp::Remove(slot));
        Ok(())
    }

    async fn query(&mut self) -> Result<BTreeSet<usize>, Error> {
        Ok(self.slots.clone())
    }
}
