//! Bounded pool of device clients for short-lived calls.
//!
//! Every quick operation (stat, listing, shell command) borrows a client
//! and returns it, which throttles concurrent short-lived adb connections.
//! Open files never borrow from here; each owns a dedicated client, so a
//! long file transfer cannot starve directory listings.
//!
//! Acquire blocks when the pool is empty. There is no timeout: short-lived
//! operations are expected to be brief, and the kernel aborts the request
//! if they are not.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

use crate::device_client::{DeviceClient, DeviceClientFactory};

pub const DEFAULT_POOL_SIZE: usize = 2;

pub struct ClientPool {
    clients: Mutex<Vec<Box<dyn DeviceClient>>>,
    available: Condvar,
}

impl ClientPool {
    /// Builds a pool with capacity `size` (values below 1 are treated as
    /// 1), seeded with a single client from `factory`.
    pub fn new(size: usize, factory: &DeviceClientFactory) -> Self {
        let size = size.max(1);
        let mut clients = Vec::with_capacity(size);
        clients.push(factory());
        Self {
            clients: Mutex::new(clients),
            available: Condvar::new(),
        }
    }

    /// Borrows a client, blocking until one is available. The guard returns
    /// it on drop.
    pub fn acquire(&self) -> PooledClient<'_> {
        let mut clients = self.clients.lock().unwrap();
        while clients.is_empty() {
            clients = self.available.wait(clients).unwrap();
        }
        let client = clients.pop().unwrap();
        PooledClient {
            pool: self,
            client: Some(client),
        }
    }

    fn check_in(&self, client: Box<dyn DeviceClient>) {
        self.clients.lock().unwrap().push(client);
        self.available.notify_one();
    }

    pub fn idle_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

/// A borrowed client; dereferences to [`DeviceClient`] and checks itself
/// back in when dropped.
pub struct PooledClient<'a> {
    pool: &'a ClientPool,
    client: Option<Box<dyn DeviceClient>>,
}

impl Deref for PooledClient<'_> {
    type Target = Box<dyn DeviceClient>;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().unwrap()
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().unwrap()
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.check_in(client);
        }
    }
}
