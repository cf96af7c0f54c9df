use webrtc::{
    rtp::{header, packet::Packet},
    util::Unmarshal,
};

use crate::error::{Error, RtpErrorKind};

pub const VERSION: u8 = 2;

const EXTENSION_BLOCK_LENGTH: usize = 4;

/// Returns the payload type of an RTP packet.
///
/// The packet is parsed the same way [`webrtc::track::track_local::TrackLocalWriter::write`]
/// parses it, so anything accepted here is accepted by the sinks.
pub fn payload_type(buf: &[u8]) -> Result<u8, Error> {
    check_extension_elements(buf)?;

    let mut raw = buf;
    let packet = Packet::unmarshal(&mut raw).map_err(|e| malformed(e.to_string()))?;
    if packet.header.version != VERSION {
        return Err(malformed(format!(
            "unsupported version {}",
            packet.header.version
        )));
    }

    Ok(packet.header.payload_type)
}

/// Walks the RFC 8285 elements of the header extension, if any, and fails when one of them runs
/// past the extension block. [`Packet::unmarshal`] reads them without a bounds check.
///
/// A packet too short to hold the extension block is left to [`Packet::unmarshal`] to reject.
fn check_extension_elements(buf: &[u8]) -> Result<(), Error> {
    let Some(&first) = buf.first() else {
        return Ok(());
    };
    if (first >> header::EXTENSION_SHIFT) & header::EXTENSION_MASK == 0 {
        return Ok(());
    }

    let start = header::CSRC_OFFSET + (first & header::CC_MASK) as usize * header::CSRC_LENGTH;
    let Some(block) = buf.get(start..start + EXTENSION_BLOCK_LENGTH) else {
        return Ok(());
    };
    let profile = u16::from_be_bytes([block[0], block[1]]);
    let length = u16::from_be_bytes([block[2], block[3]]) as usize * 4;
    let elements_start = start + EXTENSION_BLOCK_LENGTH;
    let Some(elements) = buf.get(elements_start..elements_start + length) else {
        return Ok(());
    };

    let mut offset = 0;
    while offset < elements.len() {
        let b = elements[offset];
        offset += 1;
        if b == 0x00 {
            continue;
        }
        let len = match profile {
            header::EXTENSION_PROFILE_ONE_BYTE => {
                if b >> 4 == header::EXTENSION_ID_RESERVED {
                    break;
                }
                (b & 0x0f) as usize + 1
            }
            header::EXTENSION_PROFILE_TWO_BYTE => {
                let Some(&len) = elements.get(offset) else {
                    return Err(malformed(format!(
                        "extension element {} has no length",
                        b
                    )));
                };
                offset += 1;
                len as usize
            }
            _ => return Ok(()),
        };
        offset += len;
        if offset > elements.len() {
            return Err(malformed(format!(
                "extension element overruns the {} byte extension block",
                elements.len()
            )));
        }
    }
    Ok(())
}

fn malformed(message: String) -> Error {
    Error::new_rtp(message, RtpErrorKind::MalformedPacketError)
}

/// Builds a version 2 packet without CSRCs or extensions.
#[cfg(test)]
pub(crate) fn build(payload_type: u8, sequence: u16, payload: &[u8]) -> Vec<u8> {
    use webrtc::{rtp::header::Header, util::Marshal};

    let packet = Packet {
        header: Header {
            version: VERSION,
            payload_type,
            sequence_number: sequence,
            timestamp: 90000,
            ssrc: 0x1234_5678,
            ..Default::default()
        },
        payload: payload.to_vec().into(),
    };
    packet.marshal().unwrap().to_vec()
}

/// Builds a packet whose header extension is the given profile, length and elements, verbatim.
#[cfg(test)]
pub(crate) fn build_with_extension(payload_type: u8, extension: &[u8]) -> Vec<u8> {
    let mut packet = build(payload_type, 1, b"");
    packet[0] |= header::EXTENSION_MASK << header::EXTENSION_SHIFT;
    packet.extend_from_slice(extension);
    packet
}
