//! Node info aggregator.
//!
//! Bookkeeping of the node's live connections, listeners and circuits for
//! operator status reports. Each entry gets a small per-category index that
//! stays stable for the entry's lifetime; terminate requests name entries by
//! that index.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use starling_transport::TransportStatsSnapshot;

use crate::id::{ConnectId, NodeId, StreamId};
use crate::message::ConnectorType;
use crate::stream::StreamKind;

/// One connection or listener as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Terminate index
    pub index: u32,
    /// Transport type
    pub connector: ConnectorType,
    /// Peer or bound address
    pub address: String,
    /// Counters of a live connection; `None` for listeners and
    /// transports without counters
    pub traffic: Option<TrafficStats>,
}

/// Byte and frame counters of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Bytes written, framing included
    pub bytes_sent: u64,
    /// Bytes read, framing included
    pub bytes_received: u64,
    /// Frames written
    pub frames_sent: u64,
    /// Frames read
    pub frames_received: u64,
    /// Failed reads and writes
    pub errors: u64,
}

impl From<TransportStatsSnapshot> for TrafficStats {
    fn from(stats: TransportStatsSnapshot) -> Self {
        Self {
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            frames_sent: stats.frames_sent,
            frames_received: stats.frames_received,
            errors: stats.send_errors + stats.recv_errors,
        }
    }
}

/// One circuit as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Terminate index
    pub index: u32,
    /// Circuit type
    pub kind: StreamKind,
    /// Circuit context string
    pub context: String,
    /// Node at the other end
    pub remote: NodeId,
}

/// Serializable copy of a node's info tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfoSnapshot {
    /// Live connections
    pub connections: Vec<ConnectionInfo>,
    /// Live listeners
    pub listeners: Vec<ConnectionInfo>,
    /// Live circuits
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug)]
struct Table<K, V> {
    next_index: u32,
    entries: BTreeMap<u32, (K, V)>,
}

impl<K: PartialEq + Copy, V> Table<K, V> {
    fn new() -> Self {
        Self {
            next_index: 0,
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, key: K, value: V) -> u32 {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        self.entries.insert(index, (key, value));
        index
    }

    fn remove(&mut self, key: K) -> Option<u32> {
        let index = self
            .entries
            .iter()
            .find(|(_, (k, _))| *k == key)
            .map(|(index, _)| *index)?;
        self.entries.remove(&index);
        Some(index)
    }

    fn resolve(&self, index: u32) -> Option<K> {
        self.entries.get(&index).map(|(key, _)| *key)
    }
}

fn endpoints(
    table: &Table<ConnectId, (ConnectorType, String)>,
    traffic: &dyn Fn(ConnectId) -> Option<TrafficStats>,
) -> Vec<ConnectionInfo> {
    table
        .entries
        .iter()
        .map(|(index, (id, (connector, address)))| ConnectionInfo {
            index: *index,
            connector: *connector,
            address: address.clone(),
            traffic: traffic(*id),
        })
        .collect()
}

#[derive(Debug)]
struct Tables {
    connections: Table<ConnectId, (ConnectorType, String)>,
    listeners: Table<ConnectId, (ConnectorType, String)>,
    streams: Table<StreamId, (StreamKind, String, NodeId)>,
}

/// Live-entry bookkeeping for status reports
#[derive(Debug)]
pub struct NodeInfo {
    tables: Mutex<Tables>,
}

impl NodeInfo {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                connections: Table::new(),
                listeners: Table::new(),
                streams: Table::new(),
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a connection, returning its index.
    pub fn add_connection(&self, id: ConnectId, connector: ConnectorType, address: String) -> u32 {
        self.tables().connections.insert(id, (connector, address))
    }

    /// Stop tracking a connection.
    pub fn remove_connection(&self, id: ConnectId) -> Option<u32> {
        self.tables().connections.remove(id)
    }

    /// Track a listener, returning its index.
    pub fn add_listener(&self, id: ConnectId, connector: ConnectorType, address: String) -> u32 {
        self.tables().listeners.insert(id, (connector, address))
    }

    /// Stop tracking a listener.
    pub fn remove_listener(&self, id: ConnectId) -> Option<u32> {
        self.tables().listeners.remove(id)
    }

    /// Track a circuit, returning its index.
    pub fn add_stream(&self, id: StreamId, kind: StreamKind, context: String, remote: NodeId) -> u32 {
        self.tables().streams.insert(id, (kind, context, remote))
    }

    /// Stop tracking a circuit.
    pub fn remove_stream(&self, id: StreamId) -> Option<u32> {
        self.tables().streams.remove(id)
    }

    /// Connection tracked under `index`.
    #[must_use]
    pub fn connection_at(&self, index: u32) -> Option<ConnectId> {
        self.tables().connections.resolve(index)
    }

    /// Listener tracked under `index`.
    #[must_use]
    pub fn listener_at(&self, index: u32) -> Option<ConnectId> {
        self.tables().listeners.resolve(index)
    }

    /// Circuit tracked under `index`.
    #[must_use]
    pub fn stream_at(&self, index: u32) -> Option<StreamId> {
        self.tables().streams.resolve(index)
    }

    /// Copy the tables for a status report.
    #[must_use]
    pub fn snapshot(&self) -> NodeInfoSnapshot {
        self.snapshot_with(|_| None)
    }

    /// Copy the tables, filling each connection's counters from `traffic`.
    pub fn snapshot_with(
        &self,
        traffic: impl Fn(ConnectId) -> Option<TrafficStats>,
    ) -> NodeInfoSnapshot {
        let tables = self.tables();
        NodeInfoSnapshot {
            connections: endpoints(&tables.connections, &traffic),
            listeners: endpoints(&tables.listeners, &|_| None),
            streams: tables
                .streams
                .entries
                .iter()
                .map(|(index, (_, (kind, context, remote)))| StreamInfo {
                    index: *index,
                    kind: *kind,
                    context: context.clone(),
                    remote: *remote,
                })
                .collect(),
        }
    }
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self::new()
    }
}
