// src/registry.rs
use crate::conn::Connection;
use crate::error::{ServerError, ServerResult};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

pub type ConnMap = HashMap<RawFd, Arc<Mutex<Connection>>>;

/// Live-connection registry: fd → record. One mutex serializes every
/// mutation; critical sections are a lookup, an insert or an erase, so the
/// lock is never held across I/O.
///
/// Records are handed out behind `Arc<Mutex<_>>` so a worker can keep using
/// its connection after the registry lock is released. One-shot epoll arming
/// guarantees at most one worker per fd, so the inner lock is uncontended.
pub struct Registry {
    max_connections: usize,
    conns: Mutex<ConnMap>,
}

impl Registry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a freshly accepted connection. At capacity the record is
    /// consumed and dropped, which closes its fd.
    pub fn try_insert(&self, conn: Connection) -> ServerResult<()> {
        let mut conns = self.lock();
        if conns.len() >= self.max_connections {
            return Err(ServerError::RegistryFull);
        }
        conns.insert(conn.fd(), Arc::new(Mutex::new(conn)));
        Ok(())
    }

    pub fn lookup(&self, fd: RawFd) -> Option<Arc<Mutex<Connection>>> {
        self.lock().get(&fd).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compound operations (deregister-then-erase, keep-alive re-arm) run
    /// under this guard so registry membership and notifier registration
    /// stay in step.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnMap> {
        self.conns.lock().expect("registry mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn test_conn() -> Connection {
        let (sock, _peer) = UnixStream::pair().unwrap();
        Connection::new(sock.into_raw_fd(), "127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = Registry::new(2);
        registry.try_insert(test_conn()).unwrap();
        registry.try_insert(test_conn()).unwrap();
        assert!(matches!(
            registry.try_insert(test_conn()),
            Err(ServerError::RegistryFull)
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn erase_frees_a_slot() {
        let registry = Registry::new(1);
        let conn = test_conn();
        let fd = conn.fd();
        registry.try_insert(conn).unwrap();
        assert!(registry.try_insert(test_conn()).is_err());

        registry.lock().remove(&fd);
        assert!(registry.is_empty());
        registry.try_insert(test_conn()).unwrap();
    }

    #[test]
    fn lookup_misses_after_removal() {
        let registry = Registry::new(4);
        let conn = test_conn();
        let fd = conn.fd();
        registry.try_insert(conn).unwrap();
        assert!(registry.lookup(fd).is_some());
        registry.lock().remove(&fd);
        assert!(registry.lookup(fd).is_none());
        // removing again is a no-op
        assert!(registry.lock().remove(&fd).is_none());
    }
}
