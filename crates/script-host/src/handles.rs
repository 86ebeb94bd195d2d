//! Resource handle table: opaque script tokens for natively owned objects

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use perch_protocol::HandleToken;

/// Open mode recorded with a file resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

/// A file opened through the virtual root on behalf of a script.
#[derive(Debug)]
pub struct OpenFile {
    pub file: File,
    pub mode: FileMode,
}

/// Cancellation handle for a pending asynchronous operation.
///
/// The background worker polls the flag; disposing the resource cancels the
/// work without touching the worker thread.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Socket-like collaborator object (HTTP/WebSocket plumbing lives outside
/// this crate; the table only needs send/close). The table is shared with
/// background producers, so stored objects must be thread-safe.
pub trait SocketLike: Send + Sync {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
    fn close(&mut self);
}

/// The closed set of native objects a script can hold a token for.
pub enum Resource {
    File(OpenFile),
    Buffer(Vec<u8>),
    Task(TaskHandle),
    Socket(Box<dyn SocketLike>),
}

impl Resource {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::File(_) => ResourceKind::File,
            Self::Buffer(_) => ResourceKind::Buffer,
            Self::Task(_) => ResourceKind::Task,
            Self::Socket(_) => ResourceKind::Socket,
        }
    }

    /// Release whatever the resource owns. Files and buffers drop, tasks are
    /// cancelled, sockets are closed.
    pub fn dispose(self) {
        match self {
            Self::File(_) | Self::Buffer(_) => {}
            Self::Task(task) => task.cancel(),
            Self::Socket(mut socket) => socket.close(),
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Resource::{}", self.kind())
    }
}

/// Discriminant used for typed lookups at the script boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    Buffer,
    Task,
    Socket,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Buffer => write!(f, "buffer"),
            Self::Task => write!(f, "task"),
            Self::Socket => write!(f, "socket"),
        }
    }
}

/// Errors from typed handle resolution; surfaced to scripts as argument
/// errors at the call site.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandleError {
    #[error("{token} is closed or was never open")]
    Absent { token: HandleToken },

    #[error("{token} is a {actual}, expected a {expected}")]
    WrongKind {
        token: HandleToken,
        expected: ResourceKind,
        actual: ResourceKind,
    },
}

/// Maps opaque tokens to natively owned resources.
///
/// Shared by one session and by background producers that complete work on
/// other threads, so every operation is safe under concurrent insert,
/// lookup, and removal.
#[derive(Debug, Default)]
pub struct HandleTable {
    entries: DashMap<u64, Resource>,
    next_token: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a resource under a fresh token. `None` means "no value" and
    /// allocates nothing.
    pub fn push(&self, value: Option<Resource>) -> Option<HandleToken> {
        let resource = value?;
        let token = HandleToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries.insert(token.0, resource);
        Some(token)
    }

    /// Non-consuming lookup; the entry stays for repeatable reads.
    pub fn with<R>(&self, token: HandleToken, f: impl FnOnce(&mut Resource) -> R) -> Option<R> {
        self.entries.get_mut(&token.0).map(|mut entry| f(entry.value_mut()))
    }

    /// Consuming lookup; the entry is removed (close/finalizer path).
    pub fn take(&self, token: HandleToken) -> Option<Resource> {
        self.entries.remove(&token.0).map(|(_, resource)| resource)
    }

    /// Non-consuming lookup that checks the stored kind.
    pub fn with_typed<R>(
        &self,
        token: HandleToken,
        expected: ResourceKind,
        f: impl FnOnce(&mut Resource) -> R,
    ) -> Result<R, HandleError> {
        let mut entry = self
            .entries
            .get_mut(&token.0)
            .ok_or(HandleError::Absent { token })?;
        let actual = entry.value().kind();
        if actual != expected {
            return Err(HandleError::WrongKind {
                token,
                expected,
                actual,
            });
        }
        Ok(f(entry.value_mut()))
    }

    /// Consuming lookup that checks the stored kind. On a kind mismatch the
    /// entry is left in place.
    pub fn take_typed(
        &self,
        token: HandleToken,
        expected: ResourceKind,
    ) -> Result<Resource, HandleError> {
        {
            let entry = self
                .entries
                .get(&token.0)
                .ok_or(HandleError::Absent { token })?;
            let actual = entry.value().kind();
            if actual != expected {
                return Err(HandleError::WrongKind {
                    token,
                    expected,
                    actual,
                });
            }
        }
        self.entries
            .remove(&token.0)
            .map(|(_, resource)| resource)
            .ok_or(HandleError::Absent { token })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispose every outstanding resource and clear the table.
    ///
    /// Called on session teardown; this is the defense against native
    /// handles leaking across a reboot.
    pub fn teardown(&self) {
        let tokens: Vec<u64> = self.entries.iter().map(|entry| *entry.key()).collect();
        let mut disposed = 0usize;
        for token in tokens {
            if let Some((_, resource)) = self.entries.remove(&token) {
                resource.dispose();
                disposed += 1;
            }
        }
        if disposed > 0 {
            tracing::debug!(disposed, "handle table torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSocket {
        closed: Arc<AtomicBool>,
    }

    impl SocketLike for FakeSocket {
        fn send(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn push_none_allocates_nothing() {
        let table = HandleTable::new();
        assert!(table.push(None).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn repeatable_then_consuming_reads() {
        let table = HandleTable::new();
        let token = table.push(Some(Resource::Buffer(vec![1, 2, 3]))).unwrap();

        for _ in 0..3 {
            let len = table.with(token, |r| match r {
                Resource::Buffer(b) => b.len(),
                _ => 0,
            });
            assert_eq!(len, Some(3));
        }

        assert!(table.take(token).is_some());
        assert!(table.take(token).is_none());
        assert_eq!(table.with(token, |_| ()), None);
    }

    #[test]
    fn typed_resolution_checks_kind() {
        let table = HandleTable::new();
        let token = table.push(Some(Resource::Task(TaskHandle::new()))).unwrap();

        let err = table
            .with_typed(token, ResourceKind::File, |_| ())
            .unwrap_err();
        assert!(matches!(err, HandleError::WrongKind { .. }));

        // Mismatch must not consume the entry
        assert!(table.take_typed(token, ResourceKind::Socket).is_err());
        assert_eq!(table.len(), 1);

        assert!(table.take_typed(token, ResourceKind::Task).is_ok());
        let err = table
            .with_typed(token, ResourceKind::Task, |_| ())
            .unwrap_err();
        assert!(matches!(err, HandleError::Absent { .. }));
    }

    #[test]
    fn teardown_disposes_everything() {
        let table = HandleTable::new();
        let task = TaskHandle::new();
        let closed = Arc::new(AtomicBool::new(false));

        let task_token = table.push(Some(Resource::Task(task.clone()))).unwrap();
        let socket_token = table
            .push(Some(Resource::Socket(Box::new(FakeSocket {
                closed: closed.clone(),
            }))))
            .unwrap();
        let buffer_token = table.push(Some(Resource::Buffer(vec![0; 8]))).unwrap();

        table.teardown();

        assert!(table.is_empty());
        assert!(task.is_cancelled());
        assert!(closed.load(Ordering::SeqCst));
        for token in [task_token, socket_token, buffer_token] {
            assert!(table.take(token).is_none());
        }
    }

    #[test]
    fn concurrent_insert_and_resolve() {
        let table = Arc::new(HandleTable::new());
        let mut workers = Vec::new();
        for _ in 0..4 {
            let table = table.clone();
            workers.push(std::thread::spawn(move || {
                let mut tokens = Vec::new();
                for i in 0..100 {
                    let token = table
                        .push(Some(Resource::Buffer(vec![0; i % 7])))
                        .unwrap();
                    tokens.push(token);
                }
                for token in &tokens {
                    assert!(table.with(*token, |_| ()).is_some());
                }
                for token in tokens {
                    assert!(table.take(token).is_some());
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn tokens_are_unique() {
        let table = HandleTable::new();
        let a = table.push(Some(Resource::Buffer(vec![]))).unwrap();
        let b = table.push(Some(Resource::Buffer(vec![]))).unwrap();
        assert_ne!(a, b);
    }
}
