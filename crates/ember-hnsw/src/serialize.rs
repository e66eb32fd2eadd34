//! Index snapshots.
//!
//! File format:
//! - Magic: "EMBRHNSW" (8 bytes)
//! - Version: u32 LE
//! - BodyLen: u64 LE
//! - Body: bincode-encoded [`IndexSnapshot`]
//! - Checksum: crc32c of Body, u32 LE
//!
//! Vectors are not stored; the loader fetches them from the record store by
//! id. Edges are stored as record ids so internal node ids can be reassigned
//! on load.

use crate::graph::{Node, NodeId};
use crate::index::{EntryPoint, HnswConfig, HnswIndex};
use crate::{HnswError, Result};
use ember_vector::DistanceFunction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"EMBRHNSW";
pub const SNAPSHOT_VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 8;

/// Serializable form of an [`HnswIndex`] graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub dimensions: usize,
    pub metric: DistanceFunction,
    pub m: usize,
    pub m_max0: usize,
    pub ef_construction: usize,
    /// Record id of the entry point.
    pub entry_point: Option<u64>,
    /// Per layer: record id -> neighbor record ids.
    pub layers: Vec<BTreeMap<u64, Vec<u64>>>,
    /// Tombstoned record ids, ascending.
    pub tombstones: Vec<u64>,
}

impl IndexSnapshot {
    /// Number of nodes (every node lives on layer 0).
    pub fn node_count(&self) -> usize {
        self.layers.first().map_or(0, |l| l.len())
    }

    /// Record ids of every node, ascending.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.layers.iter().take(1).flat_map(|l| l.keys().copied())
    }

    /// Encode into the on-disk format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| HnswError::Serialization(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len() + 4);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
        Ok(out)
    }

    /// Decode from the on-disk format, verifying magic, version and checksum.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + 4 {
            return Err(HnswError::Corrupt("file too short".into()));
        }
        if &data[..8] != SNAPSHOT_MAGIC {
            return Err(HnswError::Corrupt("bad magic".into()));
        }

        let version = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        if version != SNAPSHOT_VERSION {
            return Err(HnswError::Incompatible(format!(
                "snapshot version {}, expected {}",
                version, SNAPSHOT_VERSION
            )));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&data[12..20]);
        let body_len = u64::from_le_bytes(len_bytes) as usize;
        if data.len() != HEADER_LEN + body_len + 4 {
            return Err(HnswError::Corrupt(format!(
                "body length {} does not match file size {}",
                body_len,
                data.len()
            )));
        }

        let body = &data[HEADER_LEN..HEADER_LEN + body_len];
        let crc_at = HEADER_LEN + body_len;
        let expected = u32::from_le_bytes([
            data[crc_at],
            data[crc_at + 1],
            data[crc_at + 2],
            data[crc_at + 3],
        ]);
        let actual = crc32c::crc32c(body);
        if expected != actual {
            return Err(HnswError::Corrupt(format!(
                "crc mismatch: expected {:#x}, got {:#x}",
                expected, actual
            )));
        }

        bincode::deserialize(body).map_err(|e| HnswError::Serialization(e.to_string()))
    }

    /// Read and decode a snapshot file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::decode(&data)
    }

    /// Write the snapshot atomically (temp file + rename). Returns bytes written.
    pub fn write_to(&self, path: &Path) -> Result<u64> {
        let bytes = self.encode()?;
        let temp_path = path.with_extension("hnsw.tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, path)?;
        Ok(bytes.len() as u64)
    }
}

impl HnswIndex {
    /// Capture the graph structure.
    ///
    /// Concurrent inserts may or may not be included; edges to nodes added
    /// after the node table was copied are dropped.
    pub fn to_snapshot(&self) -> IndexSnapshot {
        let nodes = self.nodes.read().clone();
        let entry = *self.entry_point.read();

        let top = nodes.iter().map(|n| n.level).max().map_or(0, |l| l + 1);
        let mut layers: Vec<BTreeMap<u64, Vec<u64>>> = vec![BTreeMap::new(); top];
        let mut tombstones = Vec::new();

        for node in &nodes {
            for (layer, map) in layers.iter_mut().enumerate().take(node.level + 1) {
                let neighbors = node
                    .neighbors(layer)
                    .into_iter()
                    .filter_map(|nid| nodes.get(nid as usize).map(|n| n.id))
                    .collect();
                map.insert(node.id, neighbors);
            }
            if node.is_tombstoned() {
                tombstones.push(node.id);
            }
        }
        tombstones.sort_unstable();

        IndexSnapshot {
            dimensions: self.dimensions,
            metric: self.distance,
            m: self.config.m,
            m_max0: self.config.m_max0,
            ef_construction: self.config.ef_construction,
            entry_point: entry.and_then(|e| nodes.get(e.nid as usize).map(|n| n.id)),
            layers,
            tombstones,
        }
    }

    /// Save a snapshot of the graph to `path`. Returns bytes written.
    pub fn save(&self, path: &Path) -> Result<u64> {
        self.to_snapshot().write_to(path)
    }

    /// Rebuild an index from a snapshot without re-running construction.
    ///
    /// `vectors` supplies the vector for every node id, tombstoned ones
    /// included. The snapshot must match `dimensions`, `distance`, and the
    /// config's `m`/`m_max0`.
    pub fn from_snapshot<F>(
        snapshot: &IndexSnapshot,
        dimensions: usize,
        distance: DistanceFunction,
        config: HnswConfig,
        vectors: F,
    ) -> Result<Self>
    where
        F: Fn(u64) -> Option<Arc<[f32]>>,
    {
        let index = Self::new(dimensions, distance, config)?;
        index.check_compatible(snapshot)?;

        let base = match snapshot.layers.first() {
            Some(base) => base,
            None => {
                if snapshot.entry_point.is_some() {
                    return Err(HnswError::Corrupt("entry point in empty graph".into()));
                }
                return Ok(index);
            }
        };

        // Highest layer each node appears on
        let mut levels: BTreeMap<u64, usize> = BTreeMap::new();
        for (layer, map) in snapshot.layers.iter().enumerate() {
            for id in map.keys() {
                if !base.contains_key(id) {
                    return Err(HnswError::Corrupt(format!(
                        "node {} on layer {} is missing from layer 0",
                        id, layer
                    )));
                }
                levels.insert(*id, layer);
            }
        }

        let tombstones: HashSet<u64> = snapshot.tombstones.iter().copied().collect();
        let mut id_to_nid: HashMap<u64, NodeId> = HashMap::with_capacity(levels.len());

        for (&id, &level) in &levels {
            let vector = vectors(id).ok_or(HnswError::MissingVector(id))?;
            if vector.len() != dimensions {
                return Err(HnswError::Corrupt(format!(
                    "vector for id {} has {} dimensions, expected {}",
                    id,
                    vector.len(),
                    dimensions
                )));
            }

            let node = Node::new(id, vector, level);
            node.restore_tombstone(tombstones.contains(&id));
            let nid = index.register(Arc::new(node))?;
            id_to_nid.insert(id, nid);
        }

        for (layer, map) in snapshot.layers.iter().enumerate() {
            for (id, neighbors) in map {
                let ids = neighbors
                    .iter()
                    .map(|n| {
                        id_to_nid
                            .get(n)
                            .copied()
                            .ok_or_else(|| HnswError::Corrupt(format!("edge to unknown id {}", n)))
                    })
                    .collect::<Result<Vec<NodeId>>>()?;

                if let Some(node) = id_to_nid.get(id).and_then(|&nid| index.node(nid)) {
                    node.set_neighbors(layer, ids);
                }
            }
        }

        let entry_id = snapshot
            .entry_point
            .ok_or_else(|| HnswError::Corrupt("non-empty graph without entry point".into()))?;
        let entry_nid = *id_to_nid
            .get(&entry_id)
            .ok_or_else(|| HnswError::Corrupt(format!("unknown entry point {}", entry_id)))?;
        *index.entry_point.write() = Some(EntryPoint {
            nid: entry_nid,
            level: levels.get(&entry_id).copied().unwrap_or(0),
        });

        tracing::debug!(
            nodes = index.node_count(),
            live = index.live.load(Ordering::Relaxed),
            "Loaded index snapshot"
        );

        Ok(index)
    }

    fn check_compatible(&self, snapshot: &IndexSnapshot) -> Result<()> {
        if snapshot.dimensions != self.dimensions {
            return Err(HnswError::Incompatible(format!(
                "snapshot has {} dimensions, expected {}",
                snapshot.dimensions, self.dimensions
            )));
        }
        if snapshot.metric != self.distance {
            return Err(HnswError::Incompatible(format!(
                "snapshot uses {} distance, expected {}",
                snapshot.metric, self.distance
            )));
        }
        if snapshot.m != self.config.m || snapshot.m_max0 != self.config.m_max0 {
            return Err(HnswError::Incompatible(format!(
                "snapshot built with m={}/{}, expected {}/{}",
                snapshot.m, snapshot.m_max0, self.config.m, self.config.m_max0
            )));
        }
        Ok(())
    }
}
