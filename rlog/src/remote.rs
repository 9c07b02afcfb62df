//! Registry of remote collector addresses and their connections.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tonic::transport::Channel;

use crate::proto::log_service_client::LogServiceClient;

/// A dialed connection to one collector.
pub type Connection = LogServiceClient<Channel>;

/// Something that can hand over a list of collector addresses.
///
/// Output-replacing operations (`set_outs`/`add_outs`) accept only this
/// capability; arbitrary byte sinks do not implement it.
pub trait AddressSink: Send + Sync {
    fn addresses(&self) -> Vec<String>;
}

/// Mapping from address to an optional live connection.
///
/// Clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct RemoteSet {
    inner: Arc<Mutex<BTreeMap<String, Option<Connection>>>>,
}

impl RemoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addresses<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = Self::new();
        set.add(addrs);
        set
    }

    fn map(&self) -> MutexGuard<'_, BTreeMap<String, Option<Connection>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add addresses without a connection. Empty strings are ignored and
    /// known addresses keep their connection.
    pub fn add<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = self.map();
        for addr in addrs {
            let addr = addr.into();
            if addr.is_empty() {
                continue;
            }
            map.entry(addr).or_insert(None);
        }
    }

    pub fn unset<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = self.map();
        for addr in addrs {
            map.remove(addr.as_ref());
        }
    }

    /// The live connection for `addr`, if any.
    pub fn get(&self, addr: &str) -> Option<Connection> {
        self.map().get(addr).cloned().flatten()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.map().contains_key(addr)
    }

    pub fn keys(&self) -> Vec<String> {
        self.map().keys().cloned().collect()
    }

    pub fn set(&self, addr: impl Into<String>, conn: Connection) {
        let addr = addr.into();
        if addr.is_empty() {
            return;
        }
        self.map().insert(addr, Some(conn));
    }

    /// Drop the connection for `addr` but keep the address registered.
    pub fn disconnect(&self, addr: &str) {
        if let Some(slot) = self.map().get_mut(addr) {
            *slot = None;
        }
    }

    /// Drop every connection, keeping the addresses.
    pub fn disconnect_all(&self) {
        for slot in self.map().values_mut() {
            *slot = None;
        }
    }

    /// Addresses with a live connection.
    pub fn connected(&self) -> Vec<(String, Connection)> {
        self.map()
            .iter()
            .filter_map(|(addr, conn)| conn.clone().map(|c| (addr.clone(), c)))
            .collect()
    }

    pub fn live(&self) -> usize {
        self.map().values().filter(|c| c.is_some()).count()
    }

    /// Clear the registry. Holders of a clone see the empty registry.
    pub fn reset(&self) {
        self.map().clear();
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

impl AddressSink for RemoteSet {
    fn addresses(&self) -> Vec<String> {
        self.keys()
    }
}

/// Writing to a remote set registers the written text as an address.
impl io::Write for RemoteSet {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let addr = String::from_utf8_lossy(buf);
        self.add([addr.trim()]);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn add_is_idempotent() {
        let set = RemoteSet::new();
        set.add(["127.0.0.1:9099"]);
        for _ in 0..5 {
            set.add(["127.0.0.1:9099"]);
        }
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn empty_address_is_ignored() {
        let set = RemoteSet::with_addresses(["a:1"]);
        set.add([""]);
        set.add(Vec::<String>::new());
        assert_eq!(set.len(), 1);
        assert!(!set.contains(""));
    }

    #[test]
    fn unset_and_keys() {
        let set = RemoteSet::with_addresses(["b:2", "a:1", "c:3"]);
        set.unset(["b:2", "missing:0"]);
        assert_eq!(set.keys(), vec!["a:1".to_string(), "c:3".to_string()]);
        assert!(set.get("a:1").is_none());
        assert_eq!(set.live(), 0);
    }

    #[test]
    fn reset_keeps_identity() {
        let set = RemoteSet::with_addresses(["a:1", "b:2"]);
        let held = set.clone();

        set.reset();
        assert!(held.is_empty());

        set.add(["c:3"]);
        assert_eq!(held.keys(), vec!["c:3".to_string()]);
    }

    #[test]
    fn write_registers_address() {
        let mut set = RemoteSet::new();
        let n = set.write(b"collector.local:9099\n").unwrap();
        assert_eq!(n, 21);
        assert!(set.contains("collector.local:9099"));

        set.write_all(b"   ").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn address_sink_lists_keys() {
        let set = RemoteSet::with_addresses(["x:1", "y:2"]);
        let sink: &dyn AddressSink = &set;
        assert_eq!(sink.addresses().len(), 2);
    }
}
