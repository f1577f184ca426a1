//! In-process message bus.
//!
//! Every thread that receives messages registers one endpoint.
//! Messages are encoded into frames on send and decoded on receive,
//! so threads never share message buffers. Frames between a pair
//! of sender and receiver are delivered in order.
use crate::context::EntityID;
use crate::error::{Error, Result};
use crate::msg::Msg;
use flume::{Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Encoded message tagged with its sender.
pub type Frame = (EntityID, Vec<u8>);

#[derive(Default)]
pub struct CommBus {
    endpoints: RwLock<HashMap<EntityID, Sender<Frame>>>,
}

impl CommBus {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint which can receive messages sent to given id.
    #[inline]
    pub fn register(&self, id: EntityID) -> Result<Endpoint> {
        let mut g = self.endpoints.write();
        if g.contains_key(&id) {
            return Err(Error::EndpointExists(id));
        }
        let (tx, rx) = flume::unbounded();
        g.insert(id, tx);
        Ok(Endpoint { id, rx })
    }

    #[inline]
    pub fn deregister(&self, id: EntityID) {
        self.endpoints.write().remove(&id);
    }

    #[inline]
    pub fn is_registered(&self, id: EntityID) -> bool {
        self.endpoints.read().contains_key(&id)
    }

    #[inline]
    pub fn send(&self, from: EntityID, to: EntityID, msg: &Msg) -> Result<()> {
        let data = msg.encode()?;
        let tx = self
            .endpoints
            .read()
            .get(&to)
            .cloned()
            .ok_or(Error::EndpointNotFound(to))?;
        log::trace!("{} -> {}: {}", from, to, msg.name());
        tx.send((from, data)).map_err(|_| Error::Disconnected)
    }
}

/// Receiving side of a registered entity.
pub struct Endpoint {
    id: EntityID,
    rx: Receiver<Frame>,
}

impl Endpoint {
    #[inline]
    pub fn id(&self) -> EntityID {
        self.id
    }

    /// Block until next message arrives.
    #[inline]
    pub fn recv(&self) -> Result<(EntityID, Msg)> {
        let (sender, data) = self.rx.recv().map_err(|_| Error::Disconnected)?;
        let msg = Msg::decode(&data)?;
        Ok((sender, msg))
    }
}
