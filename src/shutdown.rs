//! Graceful shutdown.
//!
//! Handled through a [`Manager`], returned by
//! [`Balancer::run`](crate::Balancer::run). Triggering
//! [`Manager::shutdown`] stops the accept loops; the shutdown is
//! complete once every in-flight connection has been handled, which
//! [`Manager::wait`] resolves on.

use crate::prelude::{networking::*, threading::*, *};
use tokio::sync::watch::{
    channel as watch_channel, Receiver as WatchReceiver, Sender as WatchSender,
};

/// Shutdown manager.
///
/// Tracks a shutdown flag and the number of in-flight connections.
#[derive(Debug)]
#[must_use]
pub struct Manager {
    shutdown: AtomicBool,
    connections: AtomicIsize,

    listener_channel: (WatchSender<bool>, WatchReceiver<bool>),
    finish_channel: (WatchSender<()>, WatchReceiver<()>),
}
impl Manager {
    /// Creates a new manager, with no connections and shutdown untriggered.
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            connections: AtomicIsize::new(0),
            listener_channel: watch_channel(false),
            finish_channel: watch_channel(()),
        }
    }
    /// Wraps `listener` so accepting also resolves on shutdown.
    pub fn add_listener(&self, listener: TcpListener) -> Acceptor {
        Acceptor {
            listener,
            shutdown: self.listener_channel.1.clone(),
        }
    }
    /// Registers a new connection.
    pub fn add_connection(&self) {
        self.connections.fetch_add(1, atomic::Ordering::Release);
    }
    /// Removes a connection. Must pair with a previous
    /// [`Manager::add_connection`].
    ///
    /// If this was the last connection of a triggered shutdown, the
    /// shutdown completes.
    pub fn remove_connection(&self) {
        let remaining = self.connections.fetch_sub(1, atomic::Ordering::AcqRel) - 1;
        if remaining < 0 {
            error!("connection count is less than 0");
        }
        if remaining <= 0 && self.get_shutdown(atomic::Ordering::Acquire) {
            self.finish();
        }
    }
    /// Gets the number of connections currently being handled.
    #[must_use]
    pub fn connections(&self) -> isize {
        self.connections.load(atomic::Ordering::Acquire)
    }
    /// Gets whether a shutdown is triggered.
    #[must_use]
    pub fn get_shutdown(&self, order: atomic::Ordering) -> bool {
        self.shutdown.load(order)
    }
    /// Wraps the manager in an [`Arc`], ready to hand to accept loops.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Initiates a graceful shutdown: the accept loops stop, in-flight
    /// connections keep being handled.
    pub fn shutdown(&self) {
        info!("initiating graceful shutdown");
        self.shutdown.store(true, atomic::Ordering::Release);
        drop(self.listener_channel.0.send(true));
        if self.connections() <= 0 {
            self.finish();
        }
    }
    fn finish(&self) {
        info!("shutdown complete");
        drop(self.finish_channel.0.send(()));
    }
    /// Waits for the shutdown to complete.
    ///
    /// Resolves once [`Manager::shutdown`] was triggered and no
    /// connections remain in flight.
    pub async fn wait(&self) {
        let mut receiver = self.finish_channel.1.clone();
        drop(receiver.changed().await);
    }
}
impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

/// The result of [`Acceptor::accept`].
#[derive(Debug)]
#[must_use]
pub enum AcceptAction {
    /// A shutdown was triggered. Stop accepting and drop the listener.
    Shutdown,
    /// A connection was accepted, or accepting failed.
    Accept(io::Result<(TcpStream, SocketAddr)>),
}

/// A [`TcpListener`] whose accept resolves early when a shutdown is
/// triggered.
#[derive(Debug)]
#[must_use]
pub struct Acceptor {
    listener: TcpListener,
    shutdown: WatchReceiver<bool>,
}
impl Acceptor {
    /// Waits for the next connection or a shutdown, whichever
    /// comes first.
    pub async fn accept(&mut self) -> AcceptAction {
        if *self.shutdown.borrow() {
            return AcceptAction::Shutdown;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => AcceptAction::Shutdown,
            result = self.listener.accept() => AcceptAction::Accept(result),
        }
    }
    /// The wrapped listener.
    #[must_use]
    pub fn get_inner(&self) -> &TcpListener {
        &self.listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_resolves_on_shutdown() {
        let manager = Manager::new().build();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let mut acceptor = manager.add_listener(listener);

        let trigger = Arc::clone(&manager);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.shutdown();
        });
        let action = tokio::time::timeout(Duration::from_secs(5), acceptor.accept())
            .await
            .unwrap();
        assert!(matches!(action, AcceptAction::Shutdown));
        assert!(matches!(acceptor.accept().await, AcceptAction::Shutdown));
    }

    #[tokio::test]
    async fn waits_for_connections() {
        let manager = Manager::new().build();
        manager.add_connection();
        manager.shutdown();

        let waiter = Arc::clone(&manager);
        let wait = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!wait.is_finished());

        manager.remove_connection();
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn immediate_when_idle() {
        let manager = Manager::new().build();
        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(5), manager.wait())
            .await
            .unwrap();
    }
}
