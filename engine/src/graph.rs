use crate::mutex::UnsafeMutex;
use crate::port::{
    DestConn, MAX_CONNECTIONS, Port, PortFlow, PortHandle, PortId, PortOwner, PortType,
    SrcConn,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("ports have incompatible type or flow")]
    IncompatibleTypes,
    #[error("port connection limit reached")]
    FanoutExceeded,
    #[error("dangling reference to {0}")]
    DanglingReference(PortId),
}

/// Directed edge between two ports. This is the durable, enumerable form;
/// per-port caches are derived from it. `feedback` is recomputed by the
/// router on every topology change and is not serialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortConnection {
    pub src: PortId,
    pub dest: PortId,
    pub multiplier: f32,
    pub enabled: bool,
    #[serde(skip)]
    pub feedback: bool,
}

impl PortConnection {
    pub fn new(src: PortId, dest: PortId, multiplier: f32) -> Self {
        Self {
            src,
            dest,
            multiplier,
            enabled: true,
            feedback: false,
        }
    }
}

/// Arena of ports plus the central connection manager.
///
/// Ports are addressed by stable `PortId` handles; `Arc` handles are the
/// resolved cache of those ids, rebuilt after any bulk load.
pub struct PortGraph {
    ports: HashMap<PortId, PortHandle>,
    pub connections: Vec<PortConnection>,
    next_id: u32,
}

impl Default for PortGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PortGraph {
    pub fn new() -> Self {
        Self {
            ports: HashMap::new(),
            connections: vec![],
            next_id: 1,
        }
    }

    pub fn add_port(
        &mut self,
        ty: PortType,
        flow: PortFlow,
        label: impl Into<String>,
    ) -> PortHandle {
        self.add_port_owned(ty, flow, label, None)
    }

    pub fn add_port_owned(
        &mut self,
        ty: PortType,
        flow: PortFlow,
        label: impl Into<String>,
        owner: Option<PortOwner>,
    ) -> PortHandle {
        let id = PortId(self.next_id);
        self.next_id += 1;
        let handle = Arc::new(UnsafeMutex::new(Port::new(id, ty, flow, label.into(), owner)));
        self.ports.insert(id, handle.clone());
        handle
    }

    pub fn port(&self, id: PortId) -> Option<PortHandle> {
        self.ports.get(&id).cloned()
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortHandle> {
        self.ports.values()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Removes a port and every edge touching it. The owning node calls
    /// this when it is destroyed.
    pub fn remove_port(&mut self, id: PortId) {
        self.disconnect_all(id);
        self.ports.remove(&id);
    }

    pub fn connect(&mut self, src: PortId, dest: PortId) -> Result<(), GraphError> {
        self.connect_with(src, dest, 1.0)
    }

    /// Adds a directed edge with the given multiplier. Fails if the ports
    /// are not an output feeding an input of the same type, or if either
    /// side is at its connection bound. Connecting an already-connected
    /// pair is a no-op returning success.
    pub fn connect_with(
        &mut self,
        src: PortId,
        dest: PortId,
        multiplier: f32,
    ) -> Result<(), GraphError> {
        let src_handle = self.port(src).ok_or(GraphError::DanglingReference(src))?;
        let dest_handle = self.port(dest).ok_or(GraphError::DanglingReference(dest))?;

        {
            let s = src_handle.lock();
            let d = dest_handle.lock();
            if s.flow != PortFlow::Output || d.flow != PortFlow::Input || s.ty != d.ty {
                return Err(GraphError::IncompatibleTypes);
            }
            if d.src_ids.contains(&src) {
                return Ok(());
            }
            if s.dest_ids.len() >= MAX_CONNECTIONS || d.src_ids.len() >= MAX_CONNECTIONS {
                return Err(GraphError::FanoutExceeded);
            }
        }

        let conn = PortConnection::new(src, dest, multiplier);
        self.attach(&conn, &src_handle, &dest_handle);
        self.connections.push(conn);
        Ok(())
    }

    /// Re-adds a previously recorded connection, keeping its multiplier and
    /// enabled flag. Used to restore routing snapshots after a bounce.
    pub fn restore_connection(&mut self, conn: &PortConnection) -> Result<(), GraphError> {
        self.connect_with(conn.src, conn.dest, conn.multiplier)?;
        if let Some(stored) = self
            .connections
            .iter_mut()
            .find(|c| c.src == conn.src && c.dest == conn.dest)
        {
            stored.enabled = conn.enabled;
        }
        self.refresh_caches_for(conn.src, conn.dest);
        Ok(())
    }

    /// Removes the edge from the manager and both port caches. No-op if
    /// the edge is absent.
    pub fn disconnect(&mut self, src: PortId, dest: PortId) {
        let before = self.connections.len();
        self.connections
            .retain(|c| !(c.src == src && c.dest == dest));
        if self.connections.len() == before {
            return;
        }
        if let Some(s) = self.port(src) {
            let s = s.lock();
            s.dest_ids.retain(|id| *id != dest);
            s.dests.retain(|c| c.id != dest);
        }
        if let Some(d) = self.port(dest) {
            let d = d.lock();
            d.src_ids.retain(|id| *id != src);
            d.srcs.retain(|c| c.id != src);
        }
    }

    /// Removes every edge touching the port, used before destruction.
    pub fn disconnect_all(&mut self, id: PortId) {
        let edges: Vec<(PortId, PortId)> = self
            .connections
            .iter()
            .filter(|c| c.src == id || c.dest == id)
            .map(|c| (c.src, c.dest))
            .collect();
        for (src, dest) in edges {
            self.disconnect(src, dest);
        }
    }

    /// Membership check against the smaller side's cache.
    pub fn are_connected(&self, src: PortId, dest: PortId) -> bool {
        let (Some(s), Some(d)) = (self.port(src), self.port(dest)) else {
            return false;
        };
        let s = s.lock();
        let d = d.lock();
        if s.dest_ids.len() <= d.src_ids.len() {
            s.dest_ids.contains(&dest)
        } else {
            d.src_ids.contains(&src)
        }
    }

    pub fn find_connection(&self, src: PortId, dest: PortId) -> Option<&PortConnection> {
        self.connections
            .iter()
            .find(|c| c.src == src && c.dest == dest)
    }

    /// Toggles an edge without removing it. Disabled edges keep their
    /// place in the manager but contribute nothing to summation.
    pub fn set_connection_enabled(&mut self, src: PortId, dest: PortId, enabled: bool) {
        if let Some(conn) = self
            .connections
            .iter_mut()
            .find(|c| c.src == src && c.dest == dest)
        {
            conn.enabled = enabled;
        }
        self.refresh_caches_for(src, dest);
    }

    /// Resolves durable identities into port caches, dropping connections
    /// whose endpoints no longer exist. A dangling reference is fatal for
    /// that connection only: it is logged and removed, and loading
    /// continues. Returns the number of dropped connections.
    pub fn rebuild_caches(&mut self) -> usize {
        for port in self.ports.values() {
            let p = port.lock();
            p.src_ids.clear();
            p.dest_ids.clear();
            p.srcs.clear();
            p.dests.clear();
        }

        let connections = std::mem::take(&mut self.connections);
        let mut kept = Vec::with_capacity(connections.len());
        let mut dropped = 0;
        for conn in connections {
            match (self.port(conn.src), self.port(conn.dest)) {
                (Some(src), Some(dest)) => {
                    self.attach(&conn, &src, &dest);
                    kept.push(conn);
                }
                (None, _) => {
                    warn!(
                        "{}: dropping connection {} -> {}",
                        GraphError::DanglingReference(conn.src),
                        conn.src,
                        conn.dest
                    );
                    dropped += 1;
                }
                (_, None) => {
                    warn!(
                        "{}: dropping connection {} -> {}",
                        GraphError::DanglingReference(conn.dest),
                        conn.src,
                        conn.dest
                    );
                    dropped += 1;
                }
            }
        }
        self.connections = kept;
        dropped
    }

    /// Replaces the connection list with a deserialized one and resolves
    /// it. Dangling entries are dropped, not fatal.
    pub fn load_connections(&mut self, connections: Vec<PortConnection>) -> usize {
        self.connections = connections;
        self.rebuild_caches()
    }

    fn attach(&self, conn: &PortConnection, src: &PortHandle, dest: &PortHandle) {
        let s = src.lock();
        let d = dest.lock();
        s.dest_ids.push(conn.dest);
        s.dests.push(DestConn {
            id: conn.dest,
            port: dest.clone(),
        });
        d.src_ids.push(conn.src);
        d.srcs.push(SrcConn {
            id: conn.src,
            port: src.clone(),
            multiplier: conn.multiplier,
            enabled: conn.enabled,
            feedback: conn.feedback,
        });
    }

    /// Syncs the cached multiplier/enabled/feedback flags of the edges
    /// touching the given ports with the central records.
    fn refresh_caches_for(&self, src: PortId, dest: PortId) {
        let Some(conn) = self.find_connection(src, dest) else {
            return;
        };
        if let Some(d) = self.port(dest) {
            for cached in &mut d.lock().srcs {
                if cached.id == src {
                    cached.multiplier = conn.multiplier;
                    cached.enabled = conn.enabled;
                    cached.feedback = conn.feedback;
                }
            }
        }
    }

    /// Pushes recomputed feedback flags (router recalc) out to the caches.
    pub(crate) fn sync_feedback_caches(&self) {
        for conn in &self.connections {
            if let Some(d) = self.port(conn.dest) {
                for cached in &mut d.lock().srcs {
                    if cached.id == conn.src {
                        cached.feedback = conn.feedback;
                    }
                }
            }
        }
    }
}
