//! Shared storage bus
//!
//! Models a SCSI-style bus with up to 16 ids. One initiator wins
//! arbitration, selects one target, the target walks the information
//! phases, and whoever owns the bus at that point releases it.
//!
//! Losing arbitration is ordinary flow control and is reported as `false`.
//! Acting out of turn (selecting without owning the bus, changing phase
//! from the wrong id, freeing someone else's bus) is a bug in the calling
//! device and is reported as [`BusError::IllegalState`].

use crate::snapshot::{Snapshot, SnapshotError, SnapshotResult, StateReader, StateWriter};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Number of addressable ids on one bus
pub const MAX_TARGETS: usize = 16;

/// Encoded "no id" in snapshot state
const NO_ID: u8 = 0xFF;

/// Numeric bus id of an initiator or target
pub type TargetId = u8;

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("illegal bus state: {0}")]
    IllegalState(String),

    #[error("bus id out of range: {0} (max: {max})", max = MAX_TARGETS - 1)]
    InvalidId(TargetId),

    #[error("device belongs to bus {found}, not bus {expected}")]
    WrongBus { expected: u8, found: u8 },
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Bus phases, ordered by protocol stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BusPhase {
    Free = 0,
    Arbitration = 1,
    Selection = 2,
    DataIn = 3,
    DataOut = 4,
    Status = 5,
    MessageIn = 6,
    MessageOut = 7,
    Command = 8,
}

impl BusPhase {
    /// Whether the phase belongs to a selected transaction
    pub fn is_selected(self) -> bool {
        self >= BusPhase::Selection
    }
}

impl TryFrom<u8> for BusPhase {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BusPhase::Free),
            1 => Ok(BusPhase::Arbitration),
            2 => Ok(BusPhase::Selection),
            3 => Ok(BusPhase::DataIn),
            4 => Ok(BusPhase::DataOut),
            5 => Ok(BusPhase::Status),
            6 => Ok(BusPhase::MessageIn),
            7 => Ok(BusPhase::MessageOut),
            8 => Ok(BusPhase::Command),
            other => Err(other),
        }
    }
}

impl fmt::Display for BusPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a command handed to a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Status byte sent in the Status phase
    pub status: u8,
    /// Bytes sent to the initiator in the DataIn phase
    pub data_in: Vec<u8>,
}

/// A device that can be addressed on the bus
pub trait BusDevice {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Called when an initiator selects this device.
    ///
    /// Returns the phase the target moves the bus to. Returning a phase
    /// before `Selection` declines the selection.
    fn selected(&mut self, initiator: TargetId) -> BusPhase;

    /// Carry out a command after selection. The target drives the bus
    /// through the remaining phases and frees it when done.
    fn command(
        &mut self,
        bus: &mut Bus,
        own_id: TargetId,
        cdb: &[u8],
        data_out: &[u8],
    ) -> BusResult<Completion>;
}

/// Shared handle to a registered device
pub type DeviceRef = Rc<RefCell<dyn BusDevice>>;

fn same_device(a: &DeviceRef, b: &DeviceRef) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Arbitration state machine plus target registry
pub struct Bus {
    id: u8,
    phase: BusPhase,
    initiator: Option<TargetId>,
    target: Option<TargetId>,
    targets: Vec<Option<DeviceRef>>,
}

impl Bus {
    /// Create an idle bus with an empty registry
    pub fn new(id: u8) -> Self {
        Self {
            id,
            phase: BusPhase::Free,
            initiator: None,
            target: None,
            targets: vec![None; MAX_TARGETS],
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn phase(&self) -> BusPhase {
        self.phase
    }

    pub fn initiator(&self) -> Option<TargetId> {
        self.initiator
    }

    pub fn target(&self) -> Option<TargetId> {
        self.target
    }

    /// Device registered at `target_id`, if any
    pub fn device(&self, target_id: TargetId) -> Option<DeviceRef> {
        self.targets.get(target_id as usize).cloned().flatten()
    }

    /// Ids that currently have a device
    pub fn registered_ids(&self) -> Vec<TargetId> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| id as TargetId)
            .collect()
    }

    fn check_id(id: TargetId) -> BusResult<usize> {
        let index = id as usize;
        if index >= MAX_TARGETS {
            return Err(BusError::InvalidId(id));
        }
        Ok(index)
    }

    /// Bind `device` to `target_id`.
    ///
    /// Registering the same device at the same id again is a no-op.
    pub fn register(&mut self, device: &DeviceRef, bus_id: u8, target_id: TargetId) -> BusResult<()> {
        if bus_id != self.id {
            return Err(BusError::WrongBus {
                expected: self.id,
                found: bus_id,
            });
        }
        let index = Self::check_id(target_id)?;

        match self.targets[index].clone() {
            Some(existing) if same_device(&existing, device) => {
                log::debug!("bus {}: id {} already registered", self.id, target_id);
                Ok(())
            }
            Some(existing) => Err(BusError::IllegalState(format!(
                "id {} already owned by {}",
                target_id,
                existing.borrow().name()
            ))),
            None => {
                log::info!(
                    "bus {}: registered {} at id {}",
                    self.id,
                    device.borrow().name(),
                    target_id
                );
                self.targets[index] = Some(Rc::clone(device));
                Ok(())
            }
        }
    }

    /// Remove `device` from `target_id`. An empty id is left alone.
    pub fn unregister(&mut self, device: &DeviceRef, target_id: TargetId) -> BusResult<()> {
        let index = Self::check_id(target_id)?;

        match self.targets[index].clone() {
            None => Ok(()),
            Some(existing) if !same_device(&existing, device) => Err(BusError::IllegalState(format!(
                "id {} is owned by {}, not the caller",
                target_id,
                existing.borrow().name()
            ))),
            Some(_) if self.target == Some(target_id) && self.phase.is_selected() => {
                Err(BusError::IllegalState(format!(
                    "id {} is selected ({})",
                    target_id, self.phase
                )))
            }
            Some(_) => {
                self.targets[index] = None;
                log::info!("bus {}: unregistered id {}", self.id, target_id);
                Ok(())
            }
        }
    }

    /// Try to take the bus.
    ///
    /// Succeeds when the bus is free or already held by `initiator`.
    /// Losing leaves everything as it was.
    pub fn arbitrate(&mut self, initiator: TargetId) -> bool {
        if initiator as usize >= MAX_TARGETS {
            log::warn!("bus {}: arbitration from invalid id {}", self.id, initiator);
            return false;
        }
        if self.phase != BusPhase::Free && self.initiator != Some(initiator) {
            log::trace!(
                "bus {}: id {} lost arbitration to {:?}",
                self.id,
                initiator,
                self.initiator
            );
            return false;
        }

        self.phase = BusPhase::Arbitration;
        self.initiator = Some(initiator);
        self.target = None;
        log::debug!("bus {}: id {} won arbitration", self.id, initiator);
        true
    }

    /// Select `target_id` on behalf of the initiator that owns the bus.
    ///
    /// Returns `Ok(false)` when no device answers at that id or the device
    /// declines, leaving the bus in arbitration.
    pub fn select(&mut self, initiator: TargetId, target_id: TargetId) -> BusResult<bool> {
        if self.phase != BusPhase::Arbitration || self.initiator != Some(initiator) {
            return Err(BusError::IllegalState(format!(
                "id {} cannot select in phase {} (initiator {:?})",
                initiator, self.phase, self.initiator
            )));
        }
        let index = Self::check_id(target_id)?;

        let Some(device) = self.targets[index].clone() else {
            log::debug!("bus {}: no device at id {}", self.id, target_id);
            return Ok(false);
        };

        self.phase = BusPhase::Selection;
        self.target = Some(target_id);

        let next = match device.try_borrow_mut() {
            Ok(mut device) => device.selected(initiator),
            Err(_) => {
                self.phase = BusPhase::Arbitration;
                self.target = None;
                return Err(BusError::IllegalState(format!(
                    "device at id {} is busy",
                    target_id
                )));
            }
        };

        if !next.is_selected() {
            log::debug!("bus {}: id {} declined selection", self.id, target_id);
            self.phase = BusPhase::Arbitration;
            self.target = None;
            return Ok(false);
        }

        self.phase = next;
        log::debug!(
            "bus {}: id {} selected id {}, phase {}",
            self.id,
            initiator,
            target_id,
            next
        );
        Ok(true)
    }

    /// Move to `phase`. Only the selected target may do this.
    pub fn set_phase(&mut self, target_id: TargetId, phase: BusPhase) -> BusResult<()> {
        if self.target != Some(target_id) || !self.phase.is_selected() {
            return Err(BusError::IllegalState(format!(
                "id {} is not the selected target ({:?})",
                target_id, self.target
            )));
        }
        if !phase.is_selected() {
            return Err(BusError::IllegalState(format!(
                "target cannot enter phase {}",
                phase
            )));
        }

        log::trace!("bus {}: phase {} -> {}", self.id, self.phase, phase);
        self.phase = phase;
        Ok(())
    }

    /// Release the bus.
    ///
    /// In arbitration only the initiator may free it; once a target is
    /// selected only that target may.
    pub fn free(&mut self, caller: TargetId) -> BusResult<()> {
        match self.phase {
            BusPhase::Free => return Ok(()),
            BusPhase::Arbitration => {
                if self.initiator != Some(caller) {
                    return Err(BusError::IllegalState(format!(
                        "id {} cannot free bus held by initiator {:?}",
                        caller, self.initiator
                    )));
                }
            }
            _ => {
                if self.target != Some(caller) {
                    return Err(BusError::IllegalState(format!(
                        "id {} cannot free bus in phase {} (target {:?})",
                        caller, self.phase, self.target
                    )));
                }
            }
        }

        log::debug!("bus {}: freed by id {}", self.id, caller);
        self.phase = BusPhase::Free;
        self.initiator = None;
        self.target = None;
        Ok(())
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("initiator", &self.initiator)
            .field("target", &self.target)
            .field("registered", &self.registered_ids())
            .finish()
    }
}

fn encode_id(id: Option<TargetId>) -> u8 {
    id.unwrap_or(NO_ID)
}

fn decode_id(raw: u8) -> SnapshotResult<Option<TargetId>> {
    match raw {
        NO_ID => Ok(None),
        id if (id as usize) < MAX_TARGETS => Ok(Some(id)),
        id => Err(SnapshotError::InvalidState(format!("bus id {} out of range", id))),
    }
}

impl Snapshot for Bus {
    const MAGIC_START: u32 = 0x5342_5553;
    const MAGIC_END: u32 = 0x5355_4253;
    const STATE_SIZE: usize = 4;

    fn save_state(&self) -> Vec<u8> {
        StateWriter::with_capacity(Self::STATE_SIZE)
            .u8(self.id)
            .u8(self.phase as u8)
            .u8(encode_id(self.initiator))
            .u8(encode_id(self.target))
            .finish()
    }

    fn load_state(&mut self, state: &[u8]) -> SnapshotResult<()> {
        let mut reader = StateReader::new(state);
        let id = reader.u8()?;
        let raw_phase = reader.u8()?;
        let initiator = decode_id(reader.u8()?)?;
        let target = decode_id(reader.u8()?)?;

        if id != self.id {
            return Err(SnapshotError::InvalidState(format!(
                "state is for bus {}, not bus {}",
                id, self.id
            )));
        }
        let phase = BusPhase::try_from(raw_phase)
            .map_err(|p| SnapshotError::InvalidState(format!("unknown bus phase {}", p)))?;
        if phase != BusPhase::Free && initiator.is_none() {
            return Err(SnapshotError::InvalidState(format!(
                "phase {} without an initiator",
                phase
            )));
        }
        if phase.is_selected() {
            match target {
                Some(t) if self.device(t).is_some() => {}
                _ => {
                    return Err(SnapshotError::InvalidState(format!(
                        "phase {} needs a registered target, found {:?}",
                        phase, target
                    )))
                }
            }
        }

        self.phase = phase;
        self.initiator = initiator;
        self.target = if phase.is_selected() { target } else { None };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{restore_device, save_device};
    use std::io::Cursor;

    struct Probe {
        name: String,
        answer: BusPhase,
        selections: Vec<TargetId>,
    }

    impl BusDevice for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn selected(&mut self, initiator: TargetId) -> BusPhase {
            self.selections.push(initiator);
            self.answer
        }

        fn command(
            &mut self,
            bus: &mut Bus,
            own_id: TargetId,
            _cdb: &[u8],
            _data_out: &[u8],
        ) -> BusResult<Completion> {
            bus.set_phase(own_id, BusPhase::Status)?;
            bus.free(own_id)?;
            Ok(Completion {
                status: 0,
                data_in: Vec::new(),
            })
        }
    }

    fn probe(name: &str) -> DeviceRef {
        Rc::new(RefCell::new(Probe {
            name: name.to_string(),
            answer: BusPhase::Command,
            selections: Vec::new(),
        }))
    }

    fn bus_with(ids: &[TargetId]) -> Bus {
        let mut bus = Bus::new(0);
        for &id in ids {
            bus.register(&probe(&format!("dev{}", id)), 0, id).unwrap();
        }
        bus
    }

    #[test]
    fn test_register_conflict() {
        let mut bus = Bus::new(0);
        let a = probe("a");
        let b = probe("b");

        bus.register(&a, 0, 3).unwrap();
        bus.register(&a, 0, 3).unwrap();
        assert!(matches!(bus.register(&b, 0, 3), Err(BusError::IllegalState(_))));
        assert_eq!(bus.registered_ids(), vec![3]);
    }

    #[test]
    fn test_register_bounds_and_bus() {
        let mut bus = Bus::new(1);
        let a = probe("a");
        assert!(matches!(bus.register(&a, 1, 16), Err(BusError::InvalidId(16))));
        assert!(matches!(
            bus.register(&a, 0, 2),
            Err(BusError::WrongBus { expected: 1, found: 0 })
        ));
    }

    #[test]
    fn test_unregister() {
        let mut bus = Bus::new(0);
        let a = probe("a");
        let b = probe("b");
        bus.register(&a, 0, 5).unwrap();

        assert!(matches!(bus.unregister(&b, 5), Err(BusError::IllegalState(_))));
        bus.unregister(&a, 5).unwrap();
        assert!(bus.device(5).is_none());
        bus.unregister(&a, 5).unwrap();
    }

    #[test]
    fn test_arbitration_mutual_exclusion() {
        let mut bus = bus_with(&[2]);

        assert!(bus.arbitrate(7));
        assert!(!bus.arbitrate(6));
        assert_eq!(bus.phase(), BusPhase::Arbitration);
        assert_eq!(bus.initiator(), Some(7));

        // Owner may arbitrate again
        assert!(bus.arbitrate(7));

        bus.select(7, 2).unwrap();
        assert!(!bus.arbitrate(6));
        assert_eq!(bus.phase(), BusPhase::Command);
        assert_eq!(bus.target(), Some(2));
    }

    #[test]
    fn test_select_requires_arbitration() {
        let mut bus = bus_with(&[1]);
        assert!(matches!(bus.select(7, 1), Err(BusError::IllegalState(_))));

        assert!(bus.arbitrate(7));
        assert!(matches!(bus.select(6, 1), Err(BusError::IllegalState(_))));
        assert_eq!(bus.phase(), BusPhase::Arbitration);
    }

    #[test]
    fn test_select_empty_id() {
        let mut bus = bus_with(&[1]);
        assert!(bus.arbitrate(7));
        assert!(!bus.select(7, 2).unwrap());
        assert_eq!(bus.phase(), BusPhase::Arbitration);
        assert_eq!(bus.target(), None);
    }

    #[test]
    fn test_select_notifies_target() {
        let mut bus = Bus::new(0);
        let dev = Rc::new(RefCell::new(Probe {
            name: "disk".to_string(),
            answer: BusPhase::Command,
            selections: Vec::new(),
        }));
        let handle: DeviceRef = dev.clone();
        bus.register(&handle, 0, 4).unwrap();

        assert!(bus.arbitrate(7));
        assert!(bus.select(7, 4).unwrap());
        assert_eq!(dev.borrow().selections, vec![7]);
    }

    #[test]
    fn test_declined_selection() {
        let mut bus = Bus::new(0);
        let dev: DeviceRef = Rc::new(RefCell::new(Probe {
            name: "sleepy".to_string(),
            answer: BusPhase::Free,
            selections: Vec::new(),
        }));
        bus.register(&dev, 0, 1).unwrap();

        assert!(bus.arbitrate(7));
        assert!(!bus.select(7, 1).unwrap());
        assert_eq!(bus.phase(), BusPhase::Arbitration);
        assert_eq!(bus.target(), None);
    }

    #[test]
    fn test_set_phase_from_wrong_id() {
        let mut bus = bus_with(&[3, 4]);
        assert!(bus.arbitrate(7));
        assert!(bus.select(7, 4).unwrap());

        assert!(matches!(
            bus.set_phase(3, BusPhase::DataIn),
            Err(BusError::IllegalState(_))
        ));
        bus.set_phase(4, BusPhase::DataIn).unwrap();
        assert_eq!(bus.phase(), BusPhase::DataIn);
        assert!(bus.set_phase(4, BusPhase::Free).is_err());
    }

    #[test]
    fn test_free_rules() {
        let mut bus = bus_with(&[4]);
        bus.free(0).unwrap();

        assert!(bus.arbitrate(7));
        assert!(matches!(bus.free(4), Err(BusError::IllegalState(_))));
        bus.free(7).unwrap();
        assert_eq!(bus.phase(), BusPhase::Free);

        assert!(bus.arbitrate(7));
        assert!(bus.select(7, 4).unwrap());
        assert!(matches!(bus.free(7), Err(BusError::IllegalState(_))));
        bus.free(4).unwrap();
        assert_eq!(bus.phase(), BusPhase::Free);
        assert_eq!(bus.initiator(), None);
        assert_eq!(bus.target(), None);
    }

    #[test]
    fn test_unregister_selected_target() {
        let mut bus = Bus::new(0);
        let dev = probe("busy");
        bus.register(&dev, 0, 2).unwrap();
        assert!(bus.arbitrate(0));
        assert!(bus.select(0, 2).unwrap());
        assert!(bus.unregister(&dev, 2).is_err());
    }

    #[test]
    fn test_bus_snapshot_round_trip() {
        let mut bus = bus_with(&[4]);
        assert!(bus.arbitrate(7));
        assert!(bus.select(7, 4).unwrap());
        bus.set_phase(4, BusPhase::DataOut).unwrap();

        let mut out = Vec::new();
        save_device(&bus, &mut out).unwrap();

        let mut restored = bus_with(&[4]);
        restore_device(&mut restored, &mut Cursor::new(out)).unwrap();
        assert_eq!(restored.phase(), BusPhase::DataOut);
        assert_eq!(restored.initiator(), Some(7));
        assert_eq!(restored.target(), Some(4));
    }

    #[test]
    fn test_bus_snapshot_rejects_missing_target() {
        let mut bus = bus_with(&[4]);
        assert!(bus.arbitrate(7));
        assert!(bus.select(7, 4).unwrap());

        let mut out = Vec::new();
        save_device(&bus, &mut out).unwrap();

        let mut empty = Bus::new(0);
        let result = restore_device(&mut empty, &mut Cursor::new(out));
        assert!(matches!(result, Err(SnapshotError::InvalidState(_))));
        assert_eq!(empty.phase(), BusPhase::Free);
    }
}
