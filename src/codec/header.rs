use bitstream_io::{BitRead, BitReader, BitWrite, BitWriter, Endianness};

use super::ParseError;

/// The 12-byte DNS message header (RFC 1035 section 4.1.1).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub(crate) fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError> {
        writer.write_var::<u16>(16, self.id)?;
        writer.write_var::<u8>(1, self.qr as u8)?;
        writer.write_var::<u8>(4, self.opcode)?;
        writer.write_var::<u8>(1, self.aa as u8)?;
        writer.write_var::<u8>(1, self.tc as u8)?;
        writer.write_var::<u8>(1, self.rd as u8)?;
        writer.write_var::<u8>(1, self.ra as u8)?;
        writer.write_var::<u8>(3, self.z)?;
        writer.write_var::<u8>(4, self.rcode)?;
        writer.write_var::<u16>(16, self.qdcount)?;
        writer.write_var::<u16>(16, self.ancount)?;
        writer.write_var::<u16>(16, self.nscount)?;
        writer.write_var::<u16>(16, self.arcount)?;
        Ok(())
    }

    pub(crate) fn read<E: Endianness>(
        reader: &mut BitReader<&[u8], E>,
    ) -> Result<Self, ParseError> {
        Ok(Self {
            id: reader.read_var::<u16>(16)?,
            qr: reader.read_var::<u8>(1)? == 1,
            opcode: reader.read_var::<u8>(4)?,
            aa: reader.read_var::<u8>(1)? == 1,
            tc: reader.read_var::<u8>(1)? == 1,
            rd: reader.read_var::<u8>(1)? == 1,
            ra: reader.read_var::<u8>(1)? == 1,
            z: reader.read_var::<u8>(3)?,
            rcode: reader.read_var::<u8>(4)?,
            qdcount: reader.read_var::<u16>(16)?,
            ancount: reader.read_var::<u16>(16)?,
            nscount: reader.read_var::<u16>(16)?,
            arcount: reader.read_var::<u16>(16)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitstream_io::BigEndian;

    #[test]
    fn round_trips_header_bits() {
        let header = Header {
            id: 0xBEEF,
            qr: true,
            opcode: 0,
            aa: false,
            tc: true,
            rd: true,
            ra: true,
            z: 0,
            rcode: 3,
            qdcount: 1,
            ancount: 2,
            nscount: 0,
            arcount: 0,
        };

        let mut buf = Vec::new();
        {
            let mut writer = BitWriter::endian(&mut buf, BigEndian);
            header.write(&mut writer).unwrap();
        }
        assert_eq!(buf.len(), 12);

        let mut reader = BitReader::endian(&buf[..], BigEndian);
        let parsed = Header::read(&mut reader).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn encodes_flag_bits_in_place() {
        let header = Header {
            id: 0x0102,
            qr: true,
            rd: true,
            qdcount: 1,
            ..Default::default()
        };
        let mut buf = Vec::new();
        {
            let mut writer = BitWriter::endian(&mut buf, BigEndian);
            header.write(&mut writer).unwrap();
        }
        assert_eq!(&buf[0..2], &[0x01, 0x02]);
        // QR bit is the top bit of byte 2, RD the bottom bit.
        assert_eq!(buf[2], 0b1000_0001);
        assert_eq!(&buf[4..6], &[0x00, 0x01]);
    }
}
