use bitstream_io::{BigEndian, BitReader, BitWriter};

use super::{Header, ParseError, Question, Record, RecordType};

/// A full DNS message: header plus question, answer, authority and
/// additional sections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// Build a recursion-desired query for a single question.
    pub fn query(id: u16, name: &str, rtype: RecordType) -> Self {
        Self {
            header: Header {
                id,
                rd: true,
                qdcount: 1,
                ..Default::default()
            },
            questions: vec![Question::new(name, rtype)],
            ..Default::default()
        }
    }

    /// Build an empty response echoing a query's id and question section.
    pub fn response_to(query: &Message) -> Self {
        Self {
            header: Header {
                id: query.header.id,
                qr: true,
                rd: query.header.rd,
                ra: true,
                ..Default::default()
            },
            questions: query.questions.clone(),
            ..Default::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.header.qr
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additionals.len() as u16;

        let mut buf = Vec::with_capacity(512);
        {
            let mut writer = BitWriter::endian(&mut buf, BigEndian);
            header.write(&mut writer)?;
        }
        for question in &self.questions {
            question.write(&mut buf)?;
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.write(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 12 {
            return Err(ParseError::InvalidHeader);
        }
        let mut reader = BitReader::endian(&buf[0..12], BigEndian);
        let header = Header::read(&mut reader)?;

        let mut offset = 12;
        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (question, next) = Question::parse(buf, offset)?;
            questions.push(question);
            offset = next;
        }

        let mut sections = [
            Vec::with_capacity(header.ancount as usize),
            Vec::with_capacity(header.nscount as usize),
            Vec::with_capacity(header.arcount as usize),
        ];
        let counts = [header.ancount, header.nscount, header.arcount];
        for (section, count) in sections.iter_mut().zip(counts) {
            for _ in 0..count {
                let (record, next) = Record::parse(buf, offset)?;
                section.push(record);
                offset = next;
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}
