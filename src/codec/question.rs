use super::{CLASS_IN, ParseError, RecordType, parse_name, read_u16, write_labels};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Question {
    pub labels: Vec<String>,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        Self {
            labels: name
                .split('.')
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect(),
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn name(&self) -> String {
        self.labels.join(".")
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        write_labels(buf, &self.labels)?;
        buf.extend_from_slice(&u16::from(self.qtype).to_be_bytes());
        buf.extend_from_slice(&self.qclass.to_be_bytes());
        Ok(())
    }

    pub(crate) fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let (labels, mut offset) = parse_name(buf, offset)?;
        let qtype = RecordType::from(read_u16(buf, offset)?);
        let qclass = read_u16(buf, offset + 2)?;
        offset += 4;
        Ok((
            Self {
                labels,
                qtype,
                qclass,
            },
            offset,
        ))
    }
}
