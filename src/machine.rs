//! Machine assembly
//!
//! Builds the bus, attached disks and register ports from a configuration
//! and saves or restores all of their state as one snapshot stream.

use crate::bus::{Bus, BusError, BusResult, Completion, DeviceRef, TargetId};
use crate::config::Config;
use crate::disk::{Disk, DiskError};
use crate::port::{IoDeviceRef, IoMap, IoMapError, LatchPort};
use crate::scsi::{self, commands::opcodes, ScsiDisk};
use crate::snapshot::{self, SnapshotError};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use thiserror::Error;

/// Machine assembly errors
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("port error: {0}")]
    Port(#[from] IoMapError),

    #[error("snapshot record {record} ({device}): {source}")]
    Restore {
        record: usize,
        device: String,
        #[source]
        source: SnapshotError,
    },
}

/// Result type for machine operations
pub type MachineResult<T> = Result<T, MachineError>;

/// A disk on the bus
pub struct AttachedDisk {
    pub target: TargetId,
    pub device: Rc<RefCell<ScsiDisk>>,
}

/// Capacity as reported by the target itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub ready: bool,
    pub last_lba: u32,
    pub block_size: u32,
}

/// Peripheral side of a machine: one bus, its disks and the port map
pub struct Machine {
    bus: Bus,
    initiator: TargetId,
    disks: Vec<AttachedDisk>,
    ports: Vec<Rc<RefCell<LatchPort>>>,
    io: IoMap,
}

impl Machine {
    /// Attach everything a configuration describes.
    ///
    /// A disk that fails to attach aborts the whole build; disks attached
    /// before it are detached again.
    pub fn from_config(config: &Config, progress: &mut dyn Write) -> MachineResult<Self> {
        let mut machine = Self {
            bus: Bus::new(config.machine.bus_id),
            initiator: config.machine.initiator,
            disks: Vec::new(),
            ports: Vec::new(),
            io: IoMap::new(),
        };

        let mut disk_configs: Vec<_> = config.disk.iter().collect();
        disk_configs.sort_by_key(|d| d.target);

        for disk_config in disk_configs {
            let disk = match Disk::attach_with_progress(disk_config, progress) {
                Ok(disk) => disk,
                Err(e) => {
                    machine.detach();
                    return Err(e.into());
                }
            };
            machine.add_disk(disk_config.target, disk)?;
        }

        for (index, port_config) in config.port.iter().enumerate() {
            let name = port_config
                .name
                .clone()
                .unwrap_or_else(|| format!("latch{}", index));
            machine.add_port(&name, port_config.base, port_config.count, port_config.width)?;
        }

        log::info!(
            "Machine ready: {} disk(s), {} port(s) on bus {}",
            machine.disks.len(),
            machine.ports.len(),
            machine.bus.id()
        );
        Ok(machine)
    }

    /// Put `disk` on the bus at `target`
    pub fn add_disk(&mut self, target: TargetId, disk: Disk) -> MachineResult<()> {
        let device = Rc::new(RefCell::new(ScsiDisk::new(disk)));
        let handle: DeviceRef = device.clone();
        self.bus.register(&handle, self.bus.id(), target)?;

        self.disks.push(AttachedDisk { target, device });
        self.disks.sort_by_key(|d| d.target);
        Ok(())
    }

    /// Map a latch port of `count` registers at `base`
    pub fn add_port(&mut self, name: &str, base: u32, count: u32, width: u8) -> MachineResult<()> {
        let port = Rc::new(RefCell::new(LatchPort::new(name, count as usize, width)?));
        let handle: IoDeviceRef = port.clone();
        self.io.register(&handle, 0, base, count, width)?;
        self.ports.push(port);
        Ok(())
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn io(&self) -> &IoMap {
        &self.io
    }

    pub fn disks(&self) -> &[AttachedDisk] {
        &self.disks
    }

    pub fn ports(&self) -> &[Rc<RefCell<LatchPort>>] {
        &self.ports
    }

    /// Run one command from the host adapter
    pub fn execute(
        &mut self,
        target: TargetId,
        cdb: &[u8],
        data_out: &[u8],
    ) -> BusResult<Option<Completion>> {
        scsi::execute(&mut self.bus, self.initiator, target, cdb, data_out)
    }

    /// TEST UNIT READY followed by READ CAPACITY
    pub fn probe(&mut self, target: TargetId) -> BusResult<Option<ProbeResult>> {
        let Some(ready) = self.execute(target, &[opcodes::TEST_UNIT_READY, 0, 0, 0, 0, 0], &[])?
        else {
            return Ok(None);
        };
        let Some(capacity) =
            self.execute(target, &[opcodes::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0], &[])?
        else {
            return Ok(None);
        };

        let data = &capacity.data_in;
        if data.len() < 8 {
            return Ok(Some(ProbeResult {
                ready: false,
                last_lba: 0,
                block_size: 0,
            }));
        }
        Ok(Some(ProbeResult {
            ready: ready.status == scsi::commands::status::GOOD,
            last_lba: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            block_size: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        }))
    }

    /// Write every device's record: bus, disks by target id, then ports
    pub fn save_snapshot<W: Write>(&self, sink: &mut W) -> io::Result<usize> {
        let mut written = snapshot::save_device(&self.bus, sink)?;
        for disk in &self.disks {
            written += snapshot::save_device(&*disk.device.borrow(), sink)?;
        }
        for port in &self.ports {
            written += snapshot::save_device(&*port.borrow(), sink)?;
        }
        log::info!("Saved machine snapshot ({} bytes)", written);
        Ok(written)
    }

    /// Read records back in the order [`Machine::save_snapshot`] wrote them.
    ///
    /// Stops at the first bad record; devices restored before it keep
    /// their restored state.
    pub fn restore_snapshot<R: Read>(&mut self, source: &mut R) -> MachineResult<()> {
        let restore_err = |record: usize, device: &str, source: SnapshotError| MachineError::Restore {
            record,
            device: device.to_string(),
            source,
        };
        let mut record = 0;

        snapshot::restore_device(&mut self.bus, source)
            .map_err(|e| restore_err(record, "bus", e))?;
        record += 1;

        for disk in &self.disks {
            let mut device = disk.device.borrow_mut();
            snapshot::restore_device(&mut *device, source)
                .map_err(|e| restore_err(record, &format!("target {}", disk.target), e))?;
            record += 1;
        }
        for port in &self.ports {
            let mut port = port.borrow_mut();
            snapshot::restore_device(&mut *port, source)
                .map_err(|e| restore_err(record, "port", e))?;
            record += 1;
        }

        log::info!("Restored machine snapshot ({} records)", record);
        Ok(())
    }

    /// Take every disk off the bus and release its store
    pub fn detach(&mut self) {
        for disk in self.disks.drain(..) {
            let handle: DeviceRef = disk.device.clone();
            if let Err(e) = self.bus.unregister(&handle, disk.target) {
                log::warn!("target {}: {}", disk.target, e);
            }
            drop(handle);
            match Rc::try_unwrap(disk.device) {
                Ok(device) => device.into_inner().into_disk().detach(),
                Err(_) => log::warn!("target {} still referenced, store left open", disk.target),
            }
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusPhase;
    use std::io::Cursor;

    fn config() -> Config {
        Config::parse(
            r#"
[[disk]]
target = 0
backend = "memory"
size = 1048576

[[disk]]
target = 4
backend = "memory"
size = 2097152
block_size = 2048
read_only = true

[[port]]
base = 0x80
count = 4
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_from_config() {
        let mut machine = Machine::from_config(&config(), &mut io::sink()).unwrap();
        assert_eq!(machine.bus().registered_ids(), vec![0, 4]);
        assert_eq!(machine.ports().len(), 1);

        let probe = machine.probe(4).unwrap().unwrap();
        assert!(probe.ready);
        assert_eq!(probe.block_size, 2048);
        assert_eq!(probe.last_lba, 1023);
        assert!(machine.probe(5).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut machine = Machine::from_config(&config(), &mut io::sink()).unwrap();
        machine.io().write(0x81, 1, 0x5A);
        machine
            .disks()[0]
            .device
            .borrow_mut()
            .disk_mut()
            .store_mut()
            .seek(4096)
            .unwrap();

        let mut out = Vec::new();
        machine.save_snapshot(&mut out).unwrap();

        let mut restored = Machine::from_config(&config(), &mut io::sink()).unwrap();
        restored.restore_snapshot(&mut Cursor::new(&out)).unwrap();
        assert_eq!(restored.io().read(0x81, 1), 0x5A);
        assert_eq!(
            restored.disks()[0].device.borrow().disk().store().position(),
            4096
        );
        assert_eq!(restored.bus().phase(), BusPhase::Free);

        let mut again = Vec::new();
        restored.save_snapshot(&mut again).unwrap();
        assert_eq!(again, out);
    }

    #[test]
    fn test_restore_reports_bad_record() {
        let machine = Machine::from_config(&config(), &mut io::sink()).unwrap();
        let mut out = Vec::new();
        machine.save_snapshot(&mut out).unwrap();

        // Corrupt the leading magic of the second disk record
        let records = snapshot::scan_records(&mut Cursor::new(&out)).unwrap();
        let offset = records[2].offset as usize;
        out[offset] ^= 0x01;

        let mut restored = Machine::from_config(&config(), &mut io::sink()).unwrap();
        match restored.restore_snapshot(&mut Cursor::new(&out)) {
            Err(MachineError::Restore {
                record: 2,
                source: SnapshotError::MagicMismatch { .. },
                ..
            }) => {}
            other => panic!("expected restore error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_attach_failure_aborts_build() {
        let config = Config::parse(
            r#"
[[disk]]
target = 1
path = "/nonexistent-dir/for/sure/disk.img"
size = 1048576
"#,
        )
        .unwrap();

        assert!(matches!(
            Machine::from_config(&config, &mut io::sink()),
            Err(MachineError::Disk(DiskError::Attach { target: 1, .. }))
        ));
    }
}
