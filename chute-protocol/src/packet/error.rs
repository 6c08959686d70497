use std::{error::Error, fmt, io, str::Utf8Error};

#[derive(Debug)]
#[non_exhaustive]
pub enum PacketParseError {
    NotEnoughData,
    BadChecksum,
    BadChunkId,
    BadSeqNo,
    NotUtf8(Utf8Error),
    BadControlType(String),
    BadTransferRequest(String),
    BadAck(String),
    BadReport(String),
    Io(io::Error),
}

impl fmt::Display for PacketParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Self as fmt::Debug>::fmt(self, f)
    }
}

impl Error for PacketParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PacketParseError::Io(e) => Some(e),
            PacketParseError::NotUtf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PacketParseError> for io::Error {
    fn from(s: PacketParseError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, s)
    }
}

impl From<io::Error> for PacketParseError {
    fn from(s: io::Error) -> PacketParseError {
        PacketParseError::Io(s)
    }
}

impl From<Utf8Error> for PacketParseError {
    fn from(s: Utf8Error) -> PacketParseError {
        PacketParseError::NotUtf8(s)
    }
}
