//! System-wide record of active decodes
//!
//! An item id is claimed by at most one owner at a time: queued in the
//! preloader, decoding for the preloader or window, or decoding for an
//! emergency request. Claims carry the task's cancel token so a stronger
//! owner can preempt a weaker one.

use std::collections::HashMap;
use std::sync::Mutex;

use log::trace;

use super::cancel::CancelToken;
use crate::entities::ItemId;

/// Current holder of an item's decode slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeOwner {
    /// Waiting in the preloader heap
    PreloadQueued,
    /// Running for the preloader
    Preload,
    /// Running for the window loader
    Window,
    /// Running for an emergency request
    Emergency,
}

#[derive(Debug)]
struct Claim {
    owner: DecodeOwner,
    token: CancelToken,
}

/// Shared by all loaders through an `Arc`.
#[derive(Debug, Default)]
pub struct DecodeRegistry {
    claims: Mutex<HashMap<ItemId, Claim>>,
}

impl DecodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` if nobody holds it. Returns false when already claimed.
    pub fn try_claim(&self, id: ItemId, owner: DecodeOwner, token: &CancelToken) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if claims.contains_key(&id) {
            return false;
        }
        claims.insert(id, Claim { owner, token: token.clone() });
        true
    }

    /// Take `id` over, cancelling whatever task held it.
    ///
    /// Returns the previous owner, if any.
    pub fn preempt(&self, id: ItemId, owner: DecodeOwner, token: &CancelToken) -> Option<DecodeOwner> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        let previous = claims.insert(id, Claim { owner, token: token.clone() });
        previous.map(|claim| {
            if !claim.token.same_task(token) {
                claim.token.cancel();
            }
            trace!("{} preempted: {:?} -> {:?}", id, claim.owner, owner);
            claim.owner
        })
    }

    /// Claim `id` if free or only queued for preload, in one step.
    ///
    /// A queued claim is cancelled and replaced. Returns false when a
    /// running decode holds it.
    pub fn claim_or_take_queued(&self, id: ItemId, owner: DecodeOwner, token: &CancelToken) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.get(&id) {
            None => {}
            Some(claim) if claim.owner == DecodeOwner::PreloadQueued => {
                claim.token.cancel();
                trace!("{} taken from preload queue by {:?}", id, owner);
            }
            Some(_) => return false,
        }
        claims.insert(id, Claim { owner, token: token.clone() });
        true
    }

    /// Change the owner of a claim held by `token` (queued -> running)
    pub fn promote(&self, id: ItemId, token: &CancelToken, owner: DecodeOwner) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.get_mut(&id) {
            Some(claim) if claim.token.same_task(token) => {
                claim.owner = owner;
                true
            }
            _ => false,
        }
    }

    /// Release `id` if `token` still holds it. A preempted task's late
    /// release is ignored.
    pub fn release(&self, id: ItemId, token: &CancelToken) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.get(&id) {
            Some(claim) if claim.token.same_task(token) => {
                claims.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn owner(&self, id: &ItemId) -> Option<DecodeOwner> {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|c| c.owner)
    }

    pub fn is_active(&self, id: &ItemId) -> bool {
        self.claims.lock().unwrap_or_else(|e| e.into_inner()).contains_key(id)
    }

    /// Ids currently held by `owner`
    pub fn ids_owned_by(&self, owner: DecodeOwner) -> Vec<ItemId> {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, c)| c.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.claims.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
