//! SCSI disk target and initiator helper
//!
//! [`ScsiDisk`] puts an attached [`Disk`] on the bus and answers a small
//! command set. [`execute`] runs one complete transaction from the
//! initiator side.

pub mod commands;

use crate::bus::{Bus, BusDevice, BusError, BusPhase, BusResult, Completion, TargetId};
use crate::disk::Disk;
use crate::snapshot::{Snapshot, SnapshotResult, StateReader, StateWriter};
use crate::storage::OPTICAL_BLOCK_SIZE;
use commands::{asc, opcodes, sense_key, status, Sense};

/// Bus-attached disk
pub struct ScsiDisk {
    name: String,
    disk: Disk,
    sense: Sense,
}

impl ScsiDisk {
    pub fn new(disk: Disk) -> Self {
        let name = format!("scsi-disk:{}", disk.model());
        Self {
            name,
            disk,
            sense: Sense::NONE,
        }
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    pub fn disk_mut(&mut self) -> &mut Disk {
        &mut self.disk
    }

    /// Sense data from the last failed command
    pub fn sense(&self) -> Sense {
        self.sense
    }

    /// Take the disk back off the device
    pub fn into_disk(self) -> Disk {
        self.disk
    }

    fn device_type(&self) -> u8 {
        if self.disk.geometry().block_size == OPTICAL_BLOCK_SIZE {
            commands::TYPE_CDROM
        } else {
            commands::TYPE_DISK
        }
    }

    fn total_blocks(&self) -> u64 {
        let block_size = self.disk.store().block_size() as u64;
        self.disk.store().byte_size() / block_size
    }

    /// Work out the byte range of a READ/WRITE and check it against the medium
    fn transfer_range(&self, cdb: &[u8]) -> Result<(u64, usize), Sense> {
        let (lba, count) = commands::parse_read_write_cdb(cdb)?;
        if lba + count as u64 > self.total_blocks() {
            return Err(Sense::illegal(asc::LBA_OUT_OF_RANGE));
        }
        let block_size = self.disk.store().block_size() as u64;
        Ok((lba * block_size, count as usize * block_size as usize))
    }

    fn read(&mut self, cdb: &[u8]) -> Result<Vec<u8>, Sense> {
        let (offset, len) = self.transfer_range(cdb)?;
        let mut data = vec![0u8; len];
        if len == 0 {
            return Ok(data);
        }

        let got = self
            .disk
            .read_at(offset, &mut data)
            .map_err(|_| Sense::illegal(asc::LBA_OUT_OF_RANGE))?;
        if got < len {
            log::warn!("{}: short read at {} ({} of {})", self.name, offset, got, len);
            return Err(Sense::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0));
        }
        Ok(data)
    }

    fn write(&mut self, cdb: &[u8], data_out: &[u8]) -> Result<Vec<u8>, Sense> {
        let (offset, len) = self.transfer_range(cdb)?;
        if data_out.len() < len {
            return Err(Sense::illegal(asc::INVALID_FIELD_IN_CDB));
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let put = self
            .disk
            .write_at(offset, &data_out[..len])
            .map_err(|_| Sense::illegal(asc::LBA_OUT_OF_RANGE))?;
        if put == 0 {
            // The store signals write protection by transferring nothing
            return Err(Sense::new(sense_key::DATA_PROTECT, asc::WRITE_PROTECTED, 0));
        }
        if put < len {
            log::warn!("{}: short write at {} ({} of {})", self.name, offset, put, len);
            return Err(Sense::new(sense_key::MEDIUM_ERROR, asc::WRITE_FAULT, 0));
        }
        Ok(Vec::new())
    }

    /// Run a CDB, returning DataIn bytes or the sense to report
    fn dispatch(&mut self, cdb: &[u8], data_out: &[u8]) -> Result<Vec<u8>, Sense> {
        let Some(&opcode) = cdb.first() else {
            return Err(Sense::illegal(asc::INVALID_OPCODE));
        };

        match opcode {
            opcodes::TEST_UNIT_READY => Ok(Vec::new()),
            opcodes::REQUEST_SENSE => {
                let alloc = commands::alloc_len_6(cdb)?;
                let sense = std::mem::replace(&mut self.sense, Sense::NONE);
                Ok(commands::truncate(sense.to_fixed(), alloc))
            }
            opcodes::INQUIRY => {
                let alloc = commands::alloc_len_6(cdb)?;
                if cdb[1] & 0x01 != 0 {
                    // Vital product data pages are not provided
                    return Err(Sense::illegal(asc::INVALID_FIELD_IN_CDB));
                }
                let response = commands::handle_inquiry(self.disk.model(), self.device_type());
                Ok(commands::truncate(response, alloc))
            }
            opcodes::MODE_SENSE_6 => {
                let alloc = commands::alloc_len_6(cdb)?;
                let response = commands::handle_mode_sense(
                    self.disk.store().is_read_only(),
                    self.total_blocks(),
                    self.disk.store().block_size(),
                );
                Ok(commands::truncate(response, alloc))
            }
            opcodes::READ_CAPACITY_10 => Ok(commands::handle_read_capacity_10(
                self.total_blocks(),
                self.disk.store().block_size(),
            )),
            opcodes::READ_6 | opcodes::READ_10 => self.read(cdb),
            opcodes::WRITE_6 | opcodes::WRITE_10 => self.write(cdb, data_out),
            other => {
                log::debug!("{}: unsupported opcode {:#04x}", self.name, other);
                Err(Sense::illegal(asc::INVALID_OPCODE))
            }
        }
    }
}

impl BusDevice for ScsiDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn selected(&mut self, initiator: TargetId) -> BusPhase {
        log::trace!("{}: selected by id {}", self.name, initiator);
        BusPhase::Command
    }

    fn command(
        &mut self,
        bus: &mut Bus,
        own_id: TargetId,
        cdb: &[u8],
        data_out: &[u8],
    ) -> BusResult<Completion> {
        if bus.target() != Some(own_id) || bus.phase() != BusPhase::Command {
            return Err(BusError::IllegalState(format!(
                "{}: command outside of Command phase ({})",
                self.name,
                bus.phase()
            )));
        }

        if matches!(cdb.first(), Some(&opcodes::WRITE_6) | Some(&opcodes::WRITE_10)) {
            bus.set_phase(own_id, BusPhase::DataOut)?;
        }

        let is_request_sense = cdb.first() == Some(&opcodes::REQUEST_SENSE);
        let (status, data_in) = match self.dispatch(cdb, data_out) {
            Ok(data) => {
                if !is_request_sense {
                    self.sense = Sense::NONE;
                }
                (status::GOOD, data)
            }
            Err(sense) => {
                log::debug!(
                    "{}: check condition key {:#x} asc {:#04x}",
                    self.name,
                    sense.key,
                    sense.asc
                );
                self.sense = sense;
                (status::CHECK_CONDITION, Vec::new())
            }
        };

        if !data_in.is_empty() {
            bus.set_phase(own_id, BusPhase::DataIn)?;
        }
        bus.set_phase(own_id, BusPhase::Status)?;
        bus.set_phase(own_id, BusPhase::MessageIn)?;
        bus.free(own_id)?;

        Ok(Completion { status, data_in })
    }
}

impl Snapshot for ScsiDisk {
    const MAGIC_START: u32 = 0x4953_4353;
    const MAGIC_END: u32 = 0x5343_5349;
    const STATE_SIZE: usize = 4 + <Disk as Snapshot>::STATE_SIZE;

    fn save_state(&self) -> Vec<u8> {
        StateWriter::with_capacity(Self::STATE_SIZE)
            .u8(self.sense.key)
            .u8(self.sense.asc)
            .u8(self.sense.ascq)
            .u8(0)
            .bytes(&self.disk.save_state())
            .finish()
    }

    fn load_state(&mut self, state: &[u8]) -> SnapshotResult<()> {
        let mut reader = StateReader::new(state);
        let sense = Sense::new(reader.u8()?, reader.u8()?, reader.u8()?);
        self.disk.load_state(&state[4..])?;
        self.sense = sense;
        Ok(())
    }
}

/// Run one command against `target` from `initiator`.
///
/// Returns `Ok(None)` when the bus is busy or nothing answers at `target`;
/// the caller retries on its own schedule.
pub fn execute(
    bus: &mut Bus,
    initiator: TargetId,
    target: TargetId,
    cdb: &[u8],
    data_out: &[u8],
) -> BusResult<Option<Completion>> {
    if !bus.arbitrate(initiator) {
        return Ok(None);
    }
    if !bus.select(initiator, target)? {
        bus.free(initiator)?;
        return Ok(None);
    }

    let device = bus
        .device(target)
        .ok_or_else(|| BusError::IllegalState(format!("id {} vanished after selection", target)))?;
    let mut device = device
        .try_borrow_mut()
        .map_err(|_| BusError::IllegalState(format!("device at id {} is busy", target)))?;
    let completion = device.command(bus, target, cdb, data_out)?;

    if bus.phase() != BusPhase::Free {
        log::warn!(
            "bus {}: id {} left the bus in phase {}",
            bus.id(),
            target,
            bus.phase()
        );
    }
    Ok(Some(completion))
}
