use std::net::{Ipv4Addr, Ipv6Addr};

use super::{CLASS_IN, ParseError, RecordType, parse_name, read_u16, read_u32, write_labels};

/// One resource record from a DNS message.
///
/// `parsed_rdata` carries the canonical string rendering for the types the
/// resolver understands: dotted-quad for A, RFC 5952 text for AAAA and a
/// dotted domain name for the name-shaped types.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    pub labels: Vec<String>,
    pub rtype: RecordType,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
    pub parsed_rdata: Option<String>,
}

impl Record {
    /// Build a record from its canonical string data.
    pub fn from_data(
        name: &str,
        rtype: RecordType,
        ttl: u32,
        data: &str,
    ) -> Result<Self, ParseError> {
        let rdata = match rtype {
            RecordType::A => data
                .parse::<Ipv4Addr>()
                .map_err(|_| ParseError::InvalidRecord)?
                .octets()
                .to_vec(),
            RecordType::AAAA => data
                .parse::<Ipv6Addr>()
                .map_err(|_| ParseError::InvalidRecord)?
                .octets()
                .to_vec(),
            _ if rtype.is_name_shaped() => {
                let labels: Vec<String> = data
                    .split('.')
                    .filter(|label| !label.is_empty())
                    .map(str::to_string)
                    .collect();
                let mut buf = Vec::new();
                write_labels(&mut buf, &labels)?;
                buf
            }
            _ => data.as_bytes().to_vec(),
        };

        Ok(Self {
            labels: name
                .split('.')
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect(),
            rtype,
            rclass: CLASS_IN,
            ttl,
            rdata,
            parsed_rdata: Some(data.to_string()),
        })
    }

    pub fn name(&self) -> String {
        self.labels.join(".")
    }

    /// Canonical string form of the record data; falls back to hex for types
    /// the codec does not render.
    pub fn data(&self) -> String {
        match &self.parsed_rdata {
            Some(parsed) => parsed.clone(),
            None => self
                .rdata
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect(),
        }
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        write_labels(buf, &self.labels)?;
        buf.extend_from_slice(&u16::from(self.rtype).to_be_bytes());
        buf.extend_from_slice(&self.rclass.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());
        if self.rdata.len() > u16::MAX as usize {
            return Err(ParseError::InvalidRecord);
        }
        buf.extend_from_slice(&(self.rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.rdata);
        Ok(())
    }

    pub(crate) fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let (labels, mut offset) = parse_name(buf, offset)?;
        let rtype = RecordType::from(read_u16(buf, offset)?);
        let rclass = read_u16(buf, offset + 2)?;
        let ttl = read_u32(buf, offset + 4)?;
        let rdlength = read_u16(buf, offset + 8)? as usize;
        offset += 10;
        let rdata = buf
            .get(offset..offset + rdlength)
            .ok_or(ParseError::UnexpectedEnd)?
            .to_vec();
        let parsed_rdata = Self::render_rdata(buf, offset, rtype, &rdata);
        offset += rdlength;
        Ok((
            Self {
                labels,
                rtype,
                rclass,
                ttl,
                rdata,
                parsed_rdata,
            },
            offset,
        ))
    }

    /// Render RDATA to its canonical string form. Name-shaped types parse
    /// against the full packet so compression pointers resolve.
    fn render_rdata(
        packet: &[u8],
        rdata_start: usize,
        rtype: RecordType,
        rdata: &[u8],
    ) -> Option<String> {
        match rtype {
            RecordType::A => {
                if rdata.len() == 4 {
                    Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string())
                } else {
                    None
                }
            }
            RecordType::AAAA => {
                let octets: [u8; 16] = rdata.try_into().ok()?;
                Some(Ipv6Addr::from(octets).to_string())
            }
            _ if rtype.is_name_shaped() => {
                let (labels, _) = parse_name(packet, rdata_start).ok()?;
                Some(labels.join("."))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_record() {
        let record = Record::from_data("host.example", RecordType::A, 60, "10.0.0.1").unwrap();
        assert_eq!(record.rdata, vec![10, 0, 0, 1]);

        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        let (parsed, next) = Record::parse(&buf, 0).unwrap();
        assert_eq!(next, buf.len());
        assert_eq!(parsed.name(), "host.example");
        assert_eq!(parsed.data(), "10.0.0.1");
        assert_eq!(parsed.ttl, 60);
    }

    #[test]
    fn renders_aaaa_canonically() {
        let record = Record::from_data("host.example", RecordType::AAAA, 60, "2001:db8::1").unwrap();
        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        let (parsed, _) = Record::parse(&buf, 0).unwrap();
        assert_eq!(parsed.data(), "2001:db8::1");
    }

    #[test]
    fn round_trips_cname_record() {
        let record =
            Record::from_data("alias.example", RecordType::CNAME, 300, "target.example").unwrap();
        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        let (parsed, _) = Record::parse(&buf, 0).unwrap();
        assert_eq!(parsed.rtype, RecordType::CNAME);
        assert_eq!(parsed.data(), "target.example");
    }

    #[test]
    fn resolves_compressed_rdata_names() {
        // Owner name "target.example" first, then a CNAME record whose RDATA
        // is a bare pointer back to offset 0.
        let mut buf = Vec::new();
        write_labels(
            &mut buf,
            &["target".to_string(), "example".to_string()],
        )
        .unwrap();
        let record_start = buf.len();
        write_labels(&mut buf, &["alias".to_string(), "example".to_string()]).unwrap();
        buf.extend_from_slice(&u16::from(RecordType::CNAME).to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&[0xC0, 0x00]);

        let (parsed, next) = Record::parse(&buf, record_start).unwrap();
        assert_eq!(next, buf.len());
        assert_eq!(parsed.name(), "alias.example");
        assert_eq!(parsed.data(), "target.example");
    }

    #[test]
    fn unknown_rdata_renders_as_hex() {
        let record = Record {
            labels: vec!["x".to_string()],
            rtype: RecordType::Unknown(4711),
            rclass: CLASS_IN,
            ttl: 0,
            rdata: vec![0xDE, 0xAD],
            parsed_rdata: None,
        };
        assert_eq!(record.data(), "dead");
    }
}
