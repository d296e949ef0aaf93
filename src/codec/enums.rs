/// DNS resource record types surfaced by the resolver.
///
/// Only a handful of types get first-class variants; everything else rides
/// through as `Unknown` with its raw 16-bit value so the low-level query path
/// can carry arbitrary types.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RecordType {
    #[default]
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    DNAME,
    ANY,
    Unknown(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            12 => RecordType::PTR,
            15 => RecordType::MX,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            39 => RecordType::DNAME,
            255 => RecordType::ANY,
            other => RecordType::Unknown(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::PTR => 12,
            RecordType::MX => 15,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::DNAME => 39,
            RecordType::ANY => 255,
            RecordType::Unknown(other) => other,
        }
    }
}

impl RecordType {
    /// Whether the RDATA of this type is a single domain name.
    pub(crate) fn is_name_shaped(self) -> bool {
        matches!(
            self,
            RecordType::NS | RecordType::CNAME | RecordType::PTR | RecordType::DNAME
        )
    }
}
