use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Alias chains longer than this are treated as cycles
const MAX_ALIAS_HOPS: usize = 64;

/// Pipeline wiring errors raised by port access
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Read before the producing pass stored its first value
    #[error("port read before its producer set a value (generation {generation})")]
    NotProduced { generation: u64 },
    #[error("port alias chain forms a cycle")]
    AliasCycle,
    #[error("aliased port was dropped by its producer")]
    Dangling,
}

struct PortNode<T> {
    value: Option<T>,
    generation: u64,
    alias: Option<Weak<RwLock<PortNode<T>>>>,
}

type NodeRef<T> = Arc<RwLock<PortNode<T>>>;

/// Typed, generation-stamped value slot
///
/// Cloning a port shares the stored value but gives the clone its own
/// [`updated`](Port::updated) bookmark, so each consumer tracks changes
/// independently.
pub struct Port<T> {
    node: NodeRef<T>,
    /// Terminal node and generation seen by the last `updated` poll; the weak
    /// reference pins the allocation so a later node never shares its address
    last_seen: Option<(Weak<RwLock<PortNode<T>>>, u64)>,
}

impl<T> Port<T> {
    pub fn new() -> Self {
        Self {
            node: Arc::new(RwLock::new(PortNode {
                value: None,
                generation: 0,
                alias: None,
            })),
            last_seen: None,
        }
    }

    /// Port holding an initial value at generation 1
    pub fn with_value(value: T) -> Self {
        let port = Self::new();
        port.set(value);
        port
    }

    /// Store a value and bump the generation
    ///
    /// This writes the port's own slot. While the port aliases another one,
    /// readers keep seeing the aliased value.
    pub fn set(&self, value: T) {
        let mut node = self.node.write();
        node.value = Some(value);
        node.generation += 1;
    }

    /// Redirect reads through `other`
    ///
    /// Binding twice to the same port is a no-op. Binding that would make the
    /// chain revisit this port is rejected.
    pub fn bind_from(&mut self, other: &Port<T>) -> Result<(), PortError> {
        if Arc::ptr_eq(&self.node, &other.node) {
            return Err(PortError::AliasCycle);
        }

        // Walk the target chain: it must never lead back here
        let mut current = other.node.clone();
        for _ in 0..MAX_ALIAS_HOPS {
            let next = match &current.read().alias {
                Some(weak) => weak.upgrade(),
                None => None,
            };
            match next {
                Some(next) if Arc::ptr_eq(&next, &self.node) => return Err(PortError::AliasCycle),
                Some(next) => current = next,
                None => {
                    self.node.write().alias = Some(Arc::downgrade(&other.node));
                    return Ok(());
                }
            }
        }
        Err(PortError::AliasCycle)
    }

    /// Fresh port reading through `producer`
    pub fn bound_to(producer: &Port<T>) -> Result<Self, PortError> {
        let mut port = Self::new();
        port.bind_from(producer)?;
        Ok(port)
    }

    /// Drop the alias, reading this port's own slot again
    pub fn unbind(&mut self) {
        self.node.write().alias = None;
    }

    pub fn is_bound(&self) -> bool {
        self.node.read().alias.is_some()
    }

    fn resolve(&self) -> Result<NodeRef<T>, PortError> {
        let mut current = self.node.clone();
        for _ in 0..MAX_ALIAS_HOPS {
            let next = match &current.read().alias {
                Some(weak) => Some(weak.upgrade().ok_or(PortError::Dangling)?),
                None => None,
            };
            match next {
                Some(next) if Arc::ptr_eq(&next, &self.node) => return Err(PortError::AliasCycle),
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(PortError::AliasCycle)
    }

    /// Generation of the terminal port
    pub fn generation(&self) -> Result<u64, PortError> {
        Ok(self.resolve()?.read().generation)
    }

    /// Run `f` on the live value without cloning it
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, PortError> {
        let terminal = self.resolve()?;
        let node = terminal.read();
        match &node.value {
            Some(value) => Ok(f(value)),
            None => Err(PortError::NotProduced {
                generation: node.generation,
            }),
        }
    }

    /// Whether the terminal value changed since this handle last asked
    ///
    /// A port that was never set reports `false`. Rebinding to a different
    /// producer counts as a change.
    pub fn updated(&mut self) -> bool {
        let Ok(terminal) = self.resolve() else {
            return false;
        };
        let node = terminal.read();
        if node.value.is_none() {
            return false;
        }
        let seen = matches!(
            &self.last_seen,
            Some((seen, generation))
                if *generation == node.generation && Weak::ptr_eq(seen, &Arc::downgrade(&terminal))
        );
        if !seen {
            self.last_seen = Some((Arc::downgrade(&terminal), node.generation));
        }
        !seen
    }
}

impl<T: Clone> Port<T> {
    /// Clone of the live value, resolving aliases
    pub fn get(&self) -> Result<T, PortError> {
        self.with(T::clone)
    }
}

impl<T> Default for Port<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Port<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            last_seen: None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Port<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node.read();
        f.debug_struct("Port")
            .field("value", &node.value)
            .field("generation", &node.generation)
            .field("bound", &node.alias.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_before_set_is_error() {
        let port: Port<u32> = Port::new();
        assert_eq!(port.get(), Err(PortError::NotProduced { generation: 0 }));
    }

    #[test]
    fn test_set_bumps_generation() {
        let port = Port::new();
        port.set(1);
        port.set(2);
        assert_eq!(port.generation(), Ok(2));
        assert_eq!(port.get(), Ok(2));
    }

    #[test]
    fn test_updated_once_per_set() {
        let mut port = Port::new();
        assert!(!port.updated());

        port.set(10);
        assert!(port.updated());
        assert!(!port.updated());

        port.set(11);
        port.set(12);
        assert!(port.updated());
        assert!(!port.updated());
    }

    #[test]
    fn test_updated_tracks_each_poller_separately() {
        let producer = Port::new();
        let mut a = producer.clone();
        let mut b = producer.clone();
        producer.set("x");

        assert!(a.updated());
        assert!(!a.updated());
        assert!(b.updated());
    }

    #[test]
    fn test_alias_reads_through() {
        let b = Port::with_value(5);
        let mut a = Port::new();
        a.bind_from(&b).unwrap();
        assert_eq!(a.get(), b.get());

        b.set(6);
        assert_eq!(a.get(), Ok(6));
    }

    #[test]
    fn test_alias_change_is_seen_by_updated() {
        let b = Port::with_value(1);
        let mut a: Port<i32> = Port::new();
        a.bind_from(&b).unwrap();
        assert!(a.updated());
        assert!(!a.updated());
        b.set(2);
        assert!(a.updated());
    }

    #[test]
    fn test_rebind_same_target_is_idempotent() {
        let b = Port::with_value(3);
        let mut a: Port<i32> = Port::new();
        a.bind_from(&b).unwrap();
        assert!(a.updated());

        a.bind_from(&b).unwrap();
        assert!(!a.updated());
        assert_eq!(a.get(), Ok(3));
    }

    #[test]
    fn test_rebind_to_other_producer_counts_as_change() {
        let b = Port::with_value(3);
        let c = Port::with_value(3);
        let mut a: Port<i32> = Port::new();
        a.bind_from(&b).unwrap();
        assert!(a.updated());
        a.bind_from(&c).unwrap();
        assert!(a.updated());
    }

    #[test]
    fn test_alias_chain() {
        let c = Port::with_value('c');
        let mut b = Port::new();
        let mut a = Port::new();
        b.bind_from(&c).unwrap();
        a.bind_from(&b).unwrap();
        assert_eq!(a.get(), Ok('c'));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut a: Port<u8> = Port::new();
        let mut b: Port<u8> = Port::new();
        b.bind_from(&a).unwrap();
        assert_eq!(a.bind_from(&b), Err(PortError::AliasCycle));

        let a2 = a.clone();
        assert_eq!(a.bind_from(&a2), Err(PortError::AliasCycle));
    }

    #[test]
    fn test_dropped_producer_is_dangling() {
        let mut a: Port<u8> = Port::new();
        {
            let b = Port::with_value(1);
            a.bind_from(&b).unwrap();
        }
        assert_eq!(a.get(), Err(PortError::Dangling));
        assert!(!a.updated());

        a.unbind();
        a.set(4);
        assert_eq!(a.get(), Ok(4));
    }

    #[test]
    fn test_replacement_producer_is_reported_after_drop() {
        let mut consumer: Port<u8> = Port::new();
        {
            let first = Port::with_value(1);
            consumer.bind_from(&first).unwrap();
            assert!(consumer.updated());
        }
        // Each replacement starts at the same generation as the one it replaces
        for _ in 0..8 {
            let next = Port::with_value(1);
            consumer.bind_from(&next).unwrap();
            assert!(consumer.updated());
            assert!(!consumer.updated());
        }
    }

    #[test]
    fn test_clone_starts_without_bookmark() {
        let mut port = Port::with_value(3);
        assert!(port.updated());
        let mut copy = port.clone();
        assert!(copy.updated());
        assert!(!port.updated());
    }

    #[test]
    fn test_own_value_hidden_while_bound() {
        let b = Port::with_value(1);
        let mut a = Port::with_value(9);
        a.bind_from(&b).unwrap();
        assert_eq!(a.get(), Ok(1));
        a.unbind();
        assert_eq!(a.get(), Ok(9));
    }
}
