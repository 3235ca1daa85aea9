use crate::{Listener, ListenerId};

use parking_lot::{Condvar, Mutex};

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

#[derive(Default)]
struct RegistryState
{
    listeners: Mutex<Vec<Listener>>,
    changed: Condvar,
}

/// The set of running listeners, used to shut them all down together.
///
/// A listener registers itself when started and removes itself when its listener
/// thread exits. Clones refer to the same registry.
#[derive(Clone, Default)]
pub struct ListenerRegistry
{
    state: Arc<RegistryState>,
}

impl ListenerRegistry
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub(crate) fn add(&self, listener: Listener)
    {
        self.state.listeners.lock().push(listener);
        self.state.changed.notify_all();
    }

    pub(crate) fn remove(&self, id: ListenerId)
    {
        self.state.listeners.lock().retain(|l| l.id() != id);
        self.state.changed.notify_all();
    }

    pub fn listeners(&self) -> Vec<Listener>
    {
        self.state.listeners.lock().clone()
    }

    pub fn len(&self) -> usize
    {
        self.state.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.state.listeners.lock().is_empty()
    }

    /// Wait up to `timeout` for every listener to leave the registry.
    pub fn wait_empty(&self, timeout: Duration) -> bool
    {
        let deadline = Instant::now() + timeout;
        let mut listeners = self.state.listeners.lock();
        while !listeners.is_empty()
        {
            if self.state.changed.wait_until(&mut listeners, deadline).timed_out()
            {
                break;
            }
        }
        listeners.is_empty()
    }

    /// Shut down every registered listener, in parallel where there are several.
    ///
    /// Returns true only if every listener's handlers finished within `timeout` and
    /// every listener left the registry.
    pub fn shutdown_all(&self, timeout: Duration) -> bool
    {
        let listeners = self.listeners();
        if listeners.is_empty()
        {
            return true;
        }

        tracing::info!("Shutting down {} listener(s)", listeners.len());
        let failures = Arc::new(AtomicUsize::new(0));

        let mut helpers = Vec::new();
        if listeners.len() == 1
        {
            shutdown_one(&listeners[0], timeout, &failures);
        }
        else
        {
            for listener in listeners
            {
                let spawned = thread::Builder::new().name(format!("Shutdown_{}", listener.id())).spawn({
                    let listener = listener.clone();
                    let failures = Arc::clone(&failures);
                    move || shutdown_one(&listener, timeout, &failures)
                });

                match spawned {
                    Ok(handle) => helpers.push(handle),
                    Err(e) => {
                        tracing::warn!("Unable to start shutdown thread ({}); stopping {} inline", e, listener.name());
                        shutdown_one(&listener, timeout, &failures);
                    }
                }
            }
        }

        let empty = self.wait_empty(timeout + Duration::from_secs(1));

        for helper in helpers
        {
            if helper.join().is_err()
            {
                failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let failures = failures.load(Ordering::Relaxed);
        if failures > 0 || !empty
        {
            tracing::warn!("Shutdown incomplete: {} listener(s) timed out, {} still registered", failures, self.len());
        }
        failures == 0 && empty
    }
}

fn shutdown_one(listener: &Listener, timeout: Duration, failures: &AtomicUsize)
{
    if !listener.shutdown(timeout)
    {
        failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::{Handlers, ListenerConfig, PacketHandler};

    struct Nothing;

    impl PacketHandler for Nothing
    {
        fn handle_packet(&mut self, _packet: &[u8]) -> anyhow::Result<Option<Vec<u8>>>
        {
            Ok(None)
        }
    }

    #[test]
    fn empty_registry_shuts_down_immediately()
    {
        let registry = ListenerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.shutdown_all(Duration::from_secs(5)));
    }

    #[test]
    fn detached_listener_cannot_start()
    {
        let registry = ListenerRegistry::new();
        let listener = Listener::detached(ListenerConfig::tcp(0), Handlers::new(|| Nothing));
        assert!(matches!(listener.start(&registry), Err(crate::ListenerError::Detached)));
        assert!(registry.is_empty());
    }

    #[test]
    fn shutdown_all_stops_several_listeners()
    {
        let registry = ListenerRegistry::new();
        for config in [ListenerConfig::tcp(0), ListenerConfig::udp(0)]
        {
            let config = ListenerConfig { bind_address: Some("127.0.0.1".parse().unwrap()), ..config };
            Listener::bind(config, Handlers::new(|| Nothing)).unwrap().start(&registry).unwrap();
        }
        assert_eq!(registry.len(), 2);

        assert!(registry.shutdown_all(Duration::from_secs(1)));
        assert!(registry.is_empty());
    }
}
