//! In-process software demultiplexer.
//!
//! Parses a raw transport stream, reassembles sections per PID and applies
//! each started filter's value/mask pattern, emitting matches through the
//! session's [`DemuxEventSender`].

use std::collections::HashMap;

use bytes::Bytes;
use log::{debug, trace};
use parking_lot::Mutex;
use secfilter_protocol::{
    Comparator, FilterAction, FilterError, FilterFormat, FilterHandle, MAX_PID, PID_ANY,
};
use secfilter_psi::{pid, SectionCollector, TsPacket, TsPacketIterator};

use super::{Demux, DemuxEventSender};

/// Value/mask pattern as programmed into a filter slot.
///
/// Filter byte 0 is compared with the table_id; filter byte `i >= 1` with
/// section byte `i + 2`, skipping the section_length field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SectionPattern {
    value: Vec<u8>,
    mask: Vec<u8>,
    comparator: Comparator,
}

impl SectionPattern {
    fn matches(&self, section: &[u8]) -> bool {
        let mut masked = false;
        let mut differs = false;

        for (i, (&value, &mask)) in self.value.iter().zip(&self.mask).enumerate() {
            if mask == 0 {
                continue;
            }
            let offset = if i == 0 { 0 } else { i + 2 };
            let Some(&byte) = section.get(offset) else {
                return false;
            };
            masked = true;
            differs |= (byte ^ value) & mask != 0;
        }

        if !masked {
            return true;
        }
        match self.comparator {
            Comparator::Equal => !differs,
            Comparator::NotEqual => differs,
        }
    }
}

#[derive(Debug, Default)]
struct SlotConfig {
    pid: u16,
    format: FilterFormat,
    pattern: SectionPattern,
    running: bool,
}

impl SlotConfig {
    fn accepts_pid(&self, pid: u16) -> bool {
        self.running && (self.pid == PID_ANY || self.pid == pid)
    }
}

#[derive(Debug, Default)]
struct DemuxState {
    slots: HashMap<FilterHandle, SlotConfig>,
    collectors: HashMap<u16, SectionCollector>,
    /// Trailing partial packet carried over to the next feed.
    carry: Vec<u8>,
    packets: u64,
    sections: u64,
}

impl DemuxState {
    fn slot_mut(&mut self, handle: FilterHandle) -> Result<&mut SlotConfig, FilterError> {
        self.slots.get_mut(&handle).ok_or(FilterError::InvalidHandle)
    }

    fn process_packet(&mut self, packet: &TsPacket, events: &DemuxEventSender) {
        let header = &packet.header;
        if header.pid == pid::NULL || header.transport_error {
            return;
        }
        self.packets += 1;

        let mut raw: Option<Bytes> = None;
        let mut wants_sections = false;
        for (&handle, slot) in &self.slots {
            if !slot.accepts_pid(header.pid) {
                continue;
            }
            match slot.format {
                FilterFormat::TsPacket => {
                    let data = raw.get_or_insert_with(|| Bytes::copy_from_slice(packet.raw));
                    events.buffer_available(handle, data.clone());
                }
                FilterFormat::Section => wants_sections = true,
            }
        }

        if !wants_sections || header.is_scrambled() {
            return;
        }

        let sections = self.collectors.entry(header.pid).or_default().add_data(
            packet.payload,
            header.continuity_counter,
            header.payload_unit_start,
            packet.discontinuity(),
        );

        for section in sections {
            self.sections += 1;
            let section = Bytes::from(section);
            trace!(
                "[SoftwareDemux] Section table_id=0x{:02X} ({} bytes) on PID 0x{:04X}",
                section[0],
                section.len(),
                header.pid
            );
            for (&handle, slot) in &self.slots {
                if slot.format == FilterFormat::Section
                    && slot.accepts_pid(header.pid)
                    && slot.pattern.matches(&section)
                {
                    events.buffer_available(handle, section.clone());
                }
            }
        }
    }

    /// Drop reassembly state for PIDs no running section filter listens on.
    fn prune_collectors(&mut self) {
        let slots = &self.slots;
        self.collectors.retain(|&pid, _| {
            slots
                .values()
                .any(|s| s.format == FilterFormat::Section && s.accepts_pid(pid))
        });
    }
}

/// Software implementation of [`Demux`].
pub struct SoftwareDemux {
    events: DemuxEventSender,
    state: Mutex<DemuxState>,
}

impl SoftwareDemux {
    /// Create a demultiplexer that reports to the given session queue.
    pub fn new(events: DemuxEventSender) -> Self {
        Self {
            events,
            state: Mutex::new(DemuxState::default()),
        }
    }

    /// Feed raw transport stream bytes.
    ///
    /// Data does not have to be packet aligned; a trailing partial packet is
    /// kept until the next call.
    pub fn feed(&self, data: &[u8]) {
        let mut state = self.state.lock();

        let buffer = if state.carry.is_empty() {
            std::borrow::Cow::Borrowed(data)
        } else {
            let mut joined = std::mem::take(&mut state.carry);
            joined.extend_from_slice(data);
            std::borrow::Cow::Owned(joined)
        };

        let mut packets = TsPacketIterator::new(&buffer);
        for packet in packets.by_ref() {
            state.process_packet(&packet, &self.events);
        }
        let consumed = packets.offset();
        state.carry = buffer[consumed..].to_vec();
    }

    /// Packets processed so far (null and errored packets excluded).
    pub fn packet_count(&self) -> u64 {
        self.state.lock().packets
    }

    /// Sections reassembled so far, matched or not.
    pub fn section_count(&self) -> u64 {
        self.state.lock().sections
    }
}

impl Demux for SoftwareDemux {
    fn set_filter_action(&self, handle: FilterHandle, action: FilterAction) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        match action {
            FilterAction::Open => {
                state.slots.entry(handle).or_default();
            }
            FilterAction::Set => {
                state.slot_mut(handle)?;
            }
            FilterAction::Start => {
                state.slot_mut(handle)?.running = true;
            }
            FilterAction::Stop => {
                state.slot_mut(handle)?.running = false;
                state.prune_collectors();
            }
            FilterAction::Close => {
                state.slots.remove(&handle);
                state.prune_collectors();
            }
        }
        debug!("[SoftwareDemux] {} -> {:?}", handle, action);
        Ok(())
    }

    fn set_filter_pid(&self, handle: FilterHandle, pid: u16) -> Result<(), FilterError> {
        if pid > MAX_PID {
            return Err(FilterError::bad_param(format!("PID 0x{:04X} out of range", pid)));
        }
        self.state.lock().slot_mut(handle)?.pid = pid;
        Ok(())
    }

    fn set_filter_format(&self, handle: FilterHandle, format: FilterFormat) -> Result<(), FilterError> {
        self.state.lock().slot_mut(handle)?.format = format;
        Ok(())
    }

    fn set_filter_value_mask(
        &self,
        handle: FilterHandle,
        value: &[u8],
        mask: &[u8],
        comparator: Comparator,
    ) -> Result<(), FilterError> {
        self.state.lock().slot_mut(handle)?.pattern = SectionPattern {
            value: value.to_vec(),
            mask: mask.to_vec(),
            comparator,
        };
        Ok(())
    }
}
