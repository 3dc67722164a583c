//! Persistent binary log of discovered dependencies (`.ninja_deps`).
//!
//! Compilers report the headers they actually read (via depfiles or
//! /showIncludes); we record that per output here so later builds can
//! recheck those inputs without re-running the compiler.
//!
//! File layout: a magic string and version word, then a stream of records.
//! Each record starts with a little-endian u32 whose top bit selects the
//! kind and whose low bits give the payload size:
//!
//! - path record: the path's bytes padded with NULs to a 4-byte boundary,
//!   then a u32 checksum (the bitwise-not of the id this record implicitly
//!   assigns, the next dense id in sequence);
//! - deps record (top bit set): output id, output mtime as two u32 halves,
//!   then the input ids.
//!
//! A record that overruns the file or fails its checksum ends the load; the
//! valid prefix is kept and the tail truncated away.

use crate::disk::Timestamp;
use crate::graph::{Graph, NodeId};
use anyhow::{anyhow, bail, Context};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

const FILE_MAGIC: &[u8] = b"# ninjadeps\n";
const CURRENT_VERSION: u32 = 4;

/// Sanity cap on a single record; anything larger means a corrupt size field.
const MAX_RECORD_SIZE: usize = 1 << 19;

const MIN_COMPACTION_RECORD_COUNT: usize = 1000;
const COMPACTION_RATIO: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Deps {
    /// The output's mtime when the deps were recorded; deps older than the
    /// output are considered out of date by the scanner.
    pub mtime: Timestamp,
    pub nodes: Vec<NodeId>,
}

#[derive(Default)]
pub struct DepsLog {
    /// Dense id to node, in id order.
    ids: Vec<NodeId>,
    node_ids: HashMap<NodeId, usize>,
    deps: HashMap<NodeId, Deps>,
    file: Option<File>,
    needs_recompaction: bool,
}

impl DepsLog {
    pub fn new() -> Self {
        DepsLog::default()
    }

    /// Load an existing log, interning its paths into the graph.  An absent
    /// file is an empty log; a corrupt tail is dropped silently.
    pub fn load(&mut self, path: &str, graph: &mut Graph) -> anyhow::Result<()> {
        let buf = match std::fs::read(path) {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(anyhow!("read {}: {}", path, err)),
        };

        let header_len = FILE_MAGIC.len() + 4;
        if buf.len() < header_len
            || &buf[..FILE_MAGIC.len()] != FILE_MAGIC
            || read_u32(&buf[FILE_MAGIC.len()..]) != CURRENT_VERSION
        {
            // Unrecognized or obsolete format: rebuild it on the next open.
            self.needs_recompaction = true;
            return Ok(());
        }

        let mut total_record_count = 0;
        let mut unique_record_count = 0;
        let mut ofs = header_len;
        let truncate_at = loop {
            if ofs + 4 > buf.len() {
                break ofs;
            }
            let header = read_u32(&buf[ofs..]);
            let is_deps = header & 0x8000_0000 != 0;
            let size = (header & 0x7FFF_FFFF) as usize;
            if size > MAX_RECORD_SIZE || ofs + 4 + size > buf.len() {
                break ofs;
            }
            let payload = &buf[ofs + 4..ofs + 4 + size];

            if is_deps {
                if size < 12 || size % 4 != 0 {
                    break ofs;
                }
                let out_id = read_u32(payload) as usize;
                let mtime =
                    (read_u32(&payload[4..]) as i64) | ((read_u32(&payload[8..]) as i64) << 32);
                let mut nodes = Vec::with_capacity((size - 12) / 4);
                let mut ok = out_id < self.ids.len();
                for chunk in payload[12..].chunks_exact(4) {
                    let id = read_u32(chunk) as usize;
                    if id >= self.ids.len() {
                        ok = false;
                        break;
                    }
                    nodes.push(self.ids[id]);
                }
                if !ok {
                    break ofs;
                }
                total_record_count += 1;
                if self
                    .deps
                    .insert(self.ids[out_id], Deps { mtime, nodes })
                    .is_none()
                {
                    unique_record_count += 1;
                }
            } else {
                if size < 8 {
                    break ofs;
                }
                let checksum = read_u32(&payload[size - 4..]);
                let expected_id = self.ids.len() as u32;
                if checksum != !expected_id {
                    break ofs;
                }
                let mut path_len = size - 4;
                while path_len > 0 && payload[path_len - 1] == 0 {
                    path_len -= 1;
                }
                let path = String::from_utf8_lossy(&payload[..path_len]);
                let node = graph.get_node(&path, 0);
                self.node_ids.insert(node, self.ids.len());
                self.ids.push(node);
            }

            ofs += 4 + size;
            if ofs == buf.len() {
                break usize::MAX;
            }
        };

        if truncate_at != usize::MAX {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .with_context(|| format!("open {}", path))?;
            file.set_len(truncate_at as u64)
                .with_context(|| format!("truncate {}", path))?;
        }

        if total_record_count > MIN_COMPACTION_RECORD_COUNT
            && total_record_count > unique_record_count * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        }

        Ok(())
    }

    /// Open the log for appending, recompacting first if load decided to.
    pub fn open_for_write(&mut self, path: &str, graph: &Graph) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path, graph)?;
            self.needs_recompaction = false;
        }

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("open {}", path))?;
        if file.metadata()?.len() == 0 {
            file.write_all(FILE_MAGIC)?;
            file.write_all(&CURRENT_VERSION.to_le_bytes())?;
            file.flush()?;
        }
        self.file = Some(file);
        Ok(())
    }

    pub fn get_deps(&self, output: NodeId) -> Option<&Deps> {
        self.deps.get(&output)
    }

    /// Record the deps for an output, assigning ids (and emitting path
    /// records) for any nodes not seen before.  Writes nothing if the stored
    /// deps already match.
    pub fn record_deps(
        &mut self,
        graph: &Graph,
        output: NodeId,
        mtime: Timestamp,
        nodes: &[NodeId],
    ) -> anyhow::Result<()> {
        if let Some(deps) = self.deps.get(&output) {
            if deps.mtime == mtime && deps.nodes == nodes {
                return Ok(());
            }
        }

        let out_id = self.ensure_id(graph, output)?;
        let mut ids = Vec::with_capacity(nodes.len());
        for &node in nodes {
            ids.push(self.ensure_id(graph, node)?);
        }

        if let Some(file) = &mut self.file {
            let size = 12 + 4 * ids.len();
            let mut record = Vec::with_capacity(4 + size);
            record.extend_from_slice(&(size as u32 | 0x8000_0000).to_le_bytes());
            record.extend_from_slice(&(out_id as u32).to_le_bytes());
            record.extend_from_slice(&((mtime as u64 & 0xFFFF_FFFF) as u32).to_le_bytes());
            record.extend_from_slice(&((mtime as u64 >> 32) as u32).to_le_bytes());
            for id in ids {
                record.extend_from_slice(&(id as u32).to_le_bytes());
            }
            file.write_all(&record)?;
            file.flush()?;
        }

        self.deps.insert(
            output,
            Deps {
                mtime,
                nodes: nodes.to_vec(),
            },
        );
        Ok(())
    }

    fn ensure_id(&mut self, graph: &Graph, node: NodeId) -> anyhow::Result<usize> {
        if let Some(&id) = self.node_ids.get(&node) {
            return Ok(id);
        }
        let id = self.ids.len();
        let path = graph.node(node).path().as_bytes();
        if path.is_empty() {
            bail!("cannot record deps for an empty path");
        }

        if let Some(file) = &mut self.file {
            let padding = (4 - path.len() % 4) % 4;
            let size = path.len() + padding + 4;
            if size > MAX_RECORD_SIZE {
                bail!("path too long: {:?}", graph.node(node).path());
            }
            let mut record = Vec::with_capacity(4 + size);
            record.extend_from_slice(&(size as u32).to_le_bytes());
            record.extend_from_slice(path);
            record.extend_from_slice(&[0, 0, 0][..padding]);
            record.extend_from_slice(&(!(id as u32)).to_le_bytes());
            file.write_all(&record)?;
            file.flush()?;
        }

        self.node_ids.insert(node, id);
        self.ids.push(node);
        Ok(id)
    }

    /// Rewrite the log with only the live deps record per output (and the
    /// path records they reference), then swap it into place.
    pub fn recompact(&mut self, path: &str, graph: &Graph) -> anyhow::Result<()> {
        self.close();
        let temp_path = format!("{}.recompact", path);

        let mut fresh = DepsLog::new();
        let mut file = File::create(&temp_path).with_context(|| format!("open {}", temp_path))?;
        file.write_all(FILE_MAGIC)?;
        file.write_all(&CURRENT_VERSION.to_le_bytes())?;
        fresh.file = Some(file);
        for (&output, deps) in &self.deps {
            fresh.record_deps(graph, output, deps.mtime, &deps.nodes)?;
        }
        fresh.close();

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("rename {} -> {}", temp_path, path))?;
        self.ids = fresh.ids;
        self.node_ids = fresh.node_ids;
        self.deps = fresh.deps;
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}
