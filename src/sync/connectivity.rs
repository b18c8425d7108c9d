//! Connectivity signal consumed by the sync coordinator.
//!
//! The host owns a [`ConnectivityHandle`] and reports transitions into it; the
//! coordinator holds the receiving side. Tests drive the same handle to
//! simulate network flaps.

use tokio::sync::watch;

/// Network reachability as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

/// Host-side sender for connectivity transitions.
#[derive(Debug)]
pub struct ConnectivityHandle {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityHandle {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// A receiver for the coordinator; starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Report the current state. Repeating the current state is not a transition.
    ///
    /// Returns whether the state changed.
    pub fn set(&self, state: Connectivity) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bool() {
        assert_eq!(Connectivity::from(true), Connectivity::Online);
        assert_eq!(Connectivity::from(false), Connectivity::Offline);
        assert!(!Connectivity::Offline.is_online());
    }

    #[tokio::test]
    async fn test_set_only_signals_real_transitions() {
        let handle = ConnectivityHandle::new(Connectivity::Online);
        let mut rx = handle.subscribe();

        assert!(!handle.set(Connectivity::Online));
        assert!(!rx.has_changed().unwrap());

        assert!(handle.set(Connectivity::Offline));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Connectivity::Offline);
        assert_eq!(handle.current(), Connectivity::Offline);
    }
}
