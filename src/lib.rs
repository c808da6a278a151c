//! Emulated peripheral I/O subsystem
//!
//! This crate models the storage side of a virtual machine: a SCSI-style
//! bus with arbitration and strict ownership rules, disks backed by image
//! files or memory, register ports reached through an address map, and a
//! framed binary snapshot format every device uses to save and restore its
//! state.

pub mod bus;
pub mod config;
pub mod disk;
pub mod machine;
pub mod port;
pub mod scsi;
pub mod snapshot;
pub mod storage;

pub use bus::{Bus, BusDevice, BusError, BusPhase};
pub use config::Config;
pub use disk::{Disk, DiskError};
pub use machine::{Machine, MachineError};
pub use snapshot::{Snapshot, SnapshotError};
pub use storage::{BackingStore, DiskGeometry, StorageError};
