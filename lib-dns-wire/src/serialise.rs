//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.
//!
//! Names are emitted without compression: a non-compressing encoder
//! is fully interoperable, the receiver only has to be able to read
//! pointers.

use crate::types::*;

impl Message {
    /// Serialise, with the section counts synchronised to the actual
    /// section lengths.
    ///
    /// # Errors
    ///
    /// If a section is too long for its count field.
    pub fn into_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// Serialise for a UDP response.  If the full message does not
    /// fit in 512 octets, whole records are dropped from the tail
    /// (answers, then authority, then additional are filled in
    /// order), the TC flag is set, and the emitted counts cover only
    /// what was actually written.  Records are never cut mid-way.
    ///
    /// # Errors
    ///
    /// If the question section is too long for its count field.
    pub fn into_udp_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        let qdcount = usize_to_u16(self.questions.len())?;

        self.header.serialise(&mut buffer);
        buffer.write_u16(qdcount);
        let counts_index = buffer.index();
        buffer.write_u16(0);
        buffer.write_u16(0);
        buffer.write_u16(0);

        for question in self.questions {
            question.serialise(&mut buffer);
        }

        let mut counts = [0u16; 3];
        let mut truncated = false;
        'sections: for (section, count) in [self.answers, self.authority, self.additional]
            .into_iter()
            .zip(counts.iter_mut())
        {
            for rr in section {
                let boundary = buffer.index();
                rr.serialise(&mut buffer)?;
                if buffer.index() > UDP_PAYLOAD_MAX {
                    buffer.octets.truncate(boundary);
                    truncated = true;
                    break 'sections;
                }
                *count += 1;
            }
        }

        if truncated {
            buffer.octets[2] |= HEADER_MASK_TC;
        }
        for (i, count) in counts.iter().enumerate() {
            let [hi, lo] = count.to_be_bytes();
            buffer.octets[counts_index + 2 * i] = hi;
            buffer.octets[counts_index + 2 * i + 1] = lo;
        }

        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If a section is too long for its count field.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for rr in self.answers {
            rr.serialise(buffer)?;
        }
        for rr in self.authority {
            rr.serialise(buffer)?;
        }
        for rr in self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        // octet 3
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 4 (the Z bits stay zero)
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & u8::from(self.rcode);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        buffer.write_u16(self.qtype.into());
        buffer.write_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        buffer.write_u16(self.data.rtype().into());
        buffer.write_u16(self.rclass.into());
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match self.data {
            RecordData::A { address } => buffer.write_octets(&address.octets()),
            RecordData::NS { nsdname } => buffer.write_octets(&nsdname.octets),
            RecordData::CNAME { cname } => buffer.write_octets(&cname.octets),
            RecordData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                buffer.write_octets(&mname.octets);
                buffer.write_octets(&rname.octets);
                buffer.write_u32(serial);
                buffer.write_u32(refresh);
                buffer.write_u32(retry);
                buffer.write_u32(expire);
                buffer.write_u32(minimum);
            }
            RecordData::PTR { ptrdname } => buffer.write_octets(&ptrdname.octets),
            RecordData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(preference);
                buffer.write_octets(&exchange.octets);
            }
            RecordData::TXT { octets } => buffer.write_octets(&octets),
            RecordData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordData::Unknown { octets, .. } => buffer.write_octets(&octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        // `octets` is the wire form: length-prefixed labels plus the
        // terminator, validated at construction.
        buffer.write_octets(&self.octets);
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.extend(value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.extend(value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.extend_from_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}
