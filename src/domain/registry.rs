//! Characteristic Registry
//!
//! Resolves the configured characteristic descriptors against a live link.
//! Resolution is all-or-nothing: either every slot gets a handle or no
//! registry is built. A registry belongs to exactly one link and is dropped
//! when that link goes away.

use crate::domain::error::{LinkError, Result};
use crate::domain::models::{CharacteristicDescriptor, FrameProfile, Slot};
use crate::infrastructure::radio::{LinkHandle, RadioStack, ResolvedHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub handle: ResolvedHandle,
    pub profile: FrameProfile,
    pub read: bool,
    pub notify: bool,
}

#[derive(Debug)]
pub struct CharacteristicRegistry {
    link: LinkHandle,
    entries: [Option<RegistryEntry>; Slot::COUNT],
}

impl CharacteristicRegistry {
    /// Check that a descriptor set is usable before touching the radio.
    pub fn validate(descriptors: &[CharacteristicDescriptor]) -> Result<()> {
        if descriptors.is_empty() {
            return Err(LinkError::InvalidDescriptor {
                reason: "no characteristics configured".to_string(),
            });
        }
        let mut seen = [false; Slot::COUNT];
        for descriptor in descriptors {
            let index = descriptor.slot.index();
            if seen[index] {
                return Err(LinkError::InvalidDescriptor {
                    reason: format!("slot {} configured twice", descriptor.slot),
                });
            }
            seen[index] = true;
            if !descriptor.access.read && !descriptor.access.notify {
                return Err(LinkError::InvalidDescriptor {
                    reason: format!("{} is neither readable nor notifiable", descriptor.slot),
                });
            }
        }
        Ok(())
    }

    pub fn resolve<R>(
        radio: &R,
        link: LinkHandle,
        descriptors: &[CharacteristicDescriptor],
    ) -> Result<Self>
    where
        R: RadioStack + ?Sized,
    {
        Self::validate(descriptors)?;

        let mut entries = [None; Slot::COUNT];
        let mut missing = Vec::new();

        for descriptor in descriptors {
            match radio.resolve_characteristic(link, descriptor.service_id, descriptor.uuid) {
                Ok(Some(handle)) => {
                    debug!(
                        "Resolved {} characteristic {} -> handle {}",
                        descriptor.slot, descriptor.uuid, handle.value_handle
                    );
                    entries[descriptor.slot.index()] = Some(RegistryEntry {
                        handle,
                        profile: descriptor.profile(),
                        read: descriptor.access.read,
                        notify: descriptor.access.notify,
                    });
                }
                Ok(None) => {
                    warn!("Failed to resolve {} characteristic", descriptor.slot);
                    missing.push(descriptor.slot);
                }
                Err(e) => {
                    warn!("Error resolving {} characteristic: {}", descriptor.slot, e);
                    missing.push(descriptor.slot);
                }
            }
        }

        if !missing.is_empty() {
            return Err(LinkError::CharacteristicNotFound { missing });
        }

        info!("Resolved {} characteristics on link {}", descriptors.len(), link);
        Ok(Self { link, entries })
    }

    pub fn link(&self) -> LinkHandle {
        self.link
    }

    pub fn entry(&self, slot: Slot) -> Option<&RegistryEntry> {
        self.entries[slot.index()].as_ref()
    }

    pub fn handle(&self, slot: Slot) -> Option<&ResolvedHandle> {
        self.entry(slot).map(|entry| &entry.handle)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
