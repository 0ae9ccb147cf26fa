//! Synthetic transport-stream builders shared by the unit tests.

use secfilter_psi::{crc32_mpeg2, SYNC_BYTE, TS_PACKET_SIZE};

fn finish_section(mut section: Vec<u8>) -> Vec<u8> {
    let section_length = section.len() - 3 + 4;
    section[1] = 0xB0 | (section_length >> 8) as u8;
    section[2] = section_length as u8;
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

/// A PAT section with a valid CRC.
pub fn pat_section(transport_stream_id: u16, programs: &[(u16, u16)]) -> Vec<u8> {
    let mut section = vec![0x00, 0x00, 0x00];
    section.extend_from_slice(&transport_stream_id.to_be_bytes());
    section.extend_from_slice(&[0xC1, 0x00, 0x00]);
    for &(program_number, pid) in programs {
        section.extend_from_slice(&program_number.to_be_bytes());
        section.extend_from_slice(&(0xE000 | pid).to_be_bytes());
    }
    finish_section(section)
}

/// A PMT section with a valid CRC. Streams are `(stream_type, pid, es_info)`.
pub fn pmt_section(program_number: u16, pcr_pid: u16, streams: &[(u8, u16, &[u8])]) -> Vec<u8> {
    let mut section = vec![0x02, 0x00, 0x00];
    section.extend_from_slice(&program_number.to_be_bytes());
    section.extend_from_slice(&[0xC1, 0x00, 0x00]);
    section.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
    section.extend_from_slice(&[0xF0, 0x00]);
    for &(stream_type, pid, es_info) in streams {
        section.push(stream_type);
        section.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        section.extend_from_slice(&(0xF000 | es_info.len() as u16).to_be_bytes());
        section.extend_from_slice(es_info);
    }
    finish_section(section)
}

/// Split a section into TS packets on `pid`, starting at continuity counter `cc`.
pub fn section_packets(pid: u16, cc: u8, section: &[u8]) -> Vec<Vec<u8>> {
    let mut payload = Vec::with_capacity(section.len() + 1);
    payload.push(0x00);
    payload.extend_from_slice(section);

    payload
        .chunks(TS_PACKET_SIZE - 4)
        .enumerate()
        .map(|(i, chunk)| {
            let mut packet = vec![0xFFu8; TS_PACKET_SIZE];
            packet[0] = SYNC_BYTE;
            let start = if i == 0 { 0x40 } else { 0x00 };
            packet[1] = start | (pid >> 8) as u8;
            packet[2] = pid as u8;
            packet[3] = 0x10 | ((cc as usize + i) & 0x0F) as u8;
            packet[4..4 + chunk.len()].copy_from_slice(chunk);
            packet
        })
        .collect()
}
