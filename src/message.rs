//! Binary wire formats: the multicast announcement datagram and the TCP request/response bodies.
//!
//! All integers are big endian. Strings are ASCII prefixed by a `u16` byte length, byte blobs are
//! prefixed by a `u32` length and arrays by a `u16` count.

use crate::{
    id::{Identifier, ID_LEN},
    range::ByteRange,
    routing::contact::ContactInfo,
};
use bytes::{BufMut, BytesMut};
use std::{
    convert::{TryFrom, TryInto},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};
use thiserror::Error;

/// Version of the protocol spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound for a TCP frame body.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

const FLAG_RESPONSE: u8 = 0x01;
const FLAG_ERROR: u8 = 0x02;

const FIND_VALUE_FOUND: u8 = 0;
const FIND_VALUE_CONTACTS: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown operation code {0}")]
    UnknownOpcode(u8),
    #[error("string is not ascii")]
    NonAscii,
    #[error("string too long for the wire")]
    StringTooLong,
    #[error("invalid address family {0}")]
    InvalidFamily(u8),
    #[error("invalid tag {0}")]
    InvalidTag(u8),
    #[error("invalid byte range {0}..={1}")]
    InvalidRange(u64, u64),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

// ----------------------------------------------------------------------------//

/// Payload of the UDP multicast announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    pub correlation_id: u32,
    pub protocol_version: u16,
    pub tcp_port: u16,
    pub machine_id: String,
}

impl Announcement {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(10 + self.machine_id.len());
        buf.put_u32(self.correlation_id);
        buf.put_u16(self.protocol_version);
        buf.put_u16(self.tcp_port);
        put_str(&mut buf, &self.machine_id);
        buf.to_vec()
    }

    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(input);

        let announcement = Self {
            correlation_id: reader.u32()?,
            protocol_version: reader.u16()?,
            tcp_port: reader.u16()?,
            machine_id: reader.string()?,
        };

        reader.finish()?;
        Ok(announcement)
    }
}

// ----------------------------------------------------------------------------//

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Acknowledge = 1,
    Ping = 2,
    Store = 3,
    FindNode = 4,
    FindValue = 5,
    CheckFileExists = 6,
    DownloadFile = 7,
}

impl TryFrom<u8> for Opcode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::Acknowledge),
            2 => Ok(Opcode::Ping),
            3 => Ok(Opcode::Store),
            4 => Ok(Opcode::FindNode),
            5 => Ok(Opcode::FindValue),
            6 => Ok(Opcode::CheckFileExists),
            7 => Ok(Opcode::DownloadFile),
            _ => Err(DecodeError::UnknownOpcode(value)),
        }
    }
}

/// Who sent a message. Carried by every request and response so the receiver can keep its
/// routing table fresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sender {
    pub id: Identifier,
    pub tcp_port: u16,
    pub machine_id: String,
}

impl Sender {
    /// Contact for the sender, reachable at the IP the message came from.
    pub fn contact_info(&self, from: IpAddr) -> ContactInfo {
        ContactInfo::new(
            self.id,
            self.machine_id.clone(),
            SocketAddr::new(from, self.tcp_port),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub correlation_id: u32,
    pub sender: Sender,
    pub body: MessageBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Request(Request),
    Response(Response),
    Error(Opcode, String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acknowledge {
    pub protocol_version: u16,
    pub buckets: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreRequest {
    pub key: Identifier,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindRequest {
    pub target: Identifier,
    pub count: u16,
}

/// Names a file inside a shared bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileQuery {
    pub bucket: String,
    pub prefix: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRequest {
    pub file: FileQuery,
    pub range: ByteRange,
}

/// What a peer knows about a file.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FileStatus {
    pub bucket_found: bool,
    pub exists: bool,
    pub size: u64,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChunk {
    pub status: FileStatus,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueResult {
    Value(Vec<u8>),
    Contacts(Vec<ContactInfo>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Acknowledge(Acknowledge),
    Ping,
    Store(StoreRequest),
    FindNode(FindRequest),
    FindValue(FindRequest),
    CheckFileExists(FileQuery),
    DownloadFile(ChunkRequest),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Acknowledge(Acknowledge),
    Ping,
    Store(bool),
    FindNode(Vec<ContactInfo>),
    FindValue(FindValueResult),
    CheckFileExists(FileStatus),
    DownloadFile(FileChunk),
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Acknowledge(_) => Opcode::Acknowledge,
            Request::Ping => Opcode::Ping,
            Request::Store(_) => Opcode::Store,
            Request::FindNode(_) => Opcode::FindNode,
            Request::FindValue(_) => Opcode::FindValue,
            Request::CheckFileExists(_) => Opcode::CheckFileExists,
            Request::DownloadFile(_) => Opcode::DownloadFile,
        }
    }
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Acknowledge(_) => Opcode::Acknowledge,
            Response::Ping => Opcode::Ping,
            Response::Store(_) => Opcode::Store,
            Response::FindNode(_) => Opcode::FindNode,
            Response::FindValue(_) => Opcode::FindValue,
            Response::CheckFileExists(_) => Opcode::CheckFileExists,
            Response::DownloadFile(_) => Opcode::DownloadFile,
        }
    }
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match &self.body {
            MessageBody::Request(request) => request.opcode(),
            MessageBody::Response(response) => response.opcode(),
            MessageBody::Error(opcode, _) => *opcode,
        }
    }

    /// Encode the message body (without the frame length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);

        let flags = match &self.body {
            MessageBody::Request(_) => 0,
            MessageBody::Response(_) => FLAG_RESPONSE,
            MessageBody::Error(..) => FLAG_RESPONSE | FLAG_ERROR,
        };

        buf.put_u8(self.opcode() as u8);
        buf.put_u8(flags);
        buf.put_u32(self.correlation_id);
        buf.put_slice(self.sender.id.as_ref());
        buf.put_u16(self.sender.tcp_port);
        put_str(&mut buf, &self.sender.machine_id);

        match &self.body {
            MessageBody::Request(request) => encode_request(&mut buf, request),
            MessageBody::Response(response) => encode_response(&mut buf, response),
            MessageBody::Error(_, message) => put_str(&mut buf, message),
        }

        buf.to_vec()
    }

    /// Decode a message body (without the frame length prefix).
    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(input);

        let opcode = Opcode::try_from(reader.u8()?)?;
        let flags = reader.u8()?;
        let correlation_id = reader.u32()?;
        let sender = Sender {
            id: reader.id()?,
            tcp_port: reader.u16()?,
            machine_id: reader.string()?,
        };

        let body = if flags & FLAG_ERROR != 0 {
            MessageBody::Error(opcode, reader.string()?)
        } else if flags & FLAG_RESPONSE != 0 {
            MessageBody::Response(decode_response(&mut reader, opcode)?)
        } else {
            MessageBody::Request(decode_request(&mut reader, opcode)?)
        };

        reader.finish()?;

        Ok(Self {
            correlation_id,
            sender,
            body,
        })
    }
}

fn encode_request(buf: &mut BytesMut, request: &Request) {
    match request {
        Request::Acknowledge(ack) => put_acknowledge(buf, ack),
        Request::Ping => (),
        Request::Store(store) => {
            buf.put_slice(store.key.as_ref());
            put_blob(buf, &store.value);
        }
        Request::FindNode(find) | Request::FindValue(find) => {
            buf.put_slice(find.target.as_ref());
            buf.put_u16(find.count);
        }
        Request::CheckFileExists(query) => put_file_query(buf, query),
        Request::DownloadFile(chunk) => {
            put_file_query(buf, &chunk.file);
            buf.put_u64(chunk.range.start);
            buf.put_u64(chunk.range.end);
        }
    }
}

fn decode_request(reader: &mut Reader, opcode: Opcode) -> Result<Request, DecodeError> {
    Ok(match opcode {
        Opcode::Acknowledge => Request::Acknowledge(reader.acknowledge()?),
        Opcode::Ping => Request::Ping,
        Opcode::Store => Request::Store(StoreRequest {
            key: reader.id()?,
            value: reader.blob()?,
        }),
        Opcode::FindNode => Request::FindNode(FindRequest {
            target: reader.id()?,
            count: reader.u16()?,
        }),
        Opcode::FindValue => Request::FindValue(FindRequest {
            target: reader.id()?,
            count: reader.u16()?,
        }),
        Opcode::CheckFileExists => Request::CheckFileExists(reader.file_query()?),
        Opcode::DownloadFile => {
            let file = reader.file_query()?;
            let (start, end) = (reader.u64()?, reader.u64()?);

            // Only spans that a single frame could carry back.
            match end.checked_sub(start) {
                Some(span) if span < MAX_FRAME_LEN as u64 => (),
                _ => return Err(DecodeError::InvalidRange(start, end)),
            }

            Request::DownloadFile(ChunkRequest {
                file,
                range: ByteRange::new(start, end),
            })
        }
    })
}

fn encode_response(buf: &mut BytesMut, response: &Response) {
    match response {
        Response::Acknowledge(ack) => put_acknowledge(buf, ack),
        Response::Ping => (),
        Response::Store(stored) => buf.put_u8(*stored as u8),
        Response::FindNode(contacts) => put_contacts(buf, contacts),
        Response::FindValue(FindValueResult::Value(value)) => {
            buf.put_u8(FIND_VALUE_FOUND);
            put_blob(buf, value);
        }
        Response::FindValue(FindValueResult::Contacts(contacts)) => {
            buf.put_u8(FIND_VALUE_CONTACTS);
            put_contacts(buf, contacts);
        }
        Response::CheckFileExists(status) => put_file_status(buf, status),
        Response::DownloadFile(chunk) => {
            put_file_status(buf, &chunk.status);
            put_blob(buf, &chunk.data);
        }
    }
}

fn decode_response(reader: &mut Reader, opcode: Opcode) -> Result<Response, DecodeError> {
    Ok(match opcode {
        Opcode::Acknowledge => Response::Acknowledge(reader.acknowledge()?),
        Opcode::Ping => Response::Ping,
        Opcode::Store => Response::Store(reader.bool()?),
        Opcode::FindNode => Response::FindNode(reader.contacts()?),
        Opcode::FindValue => match reader.u8()? {
            FIND_VALUE_FOUND => Response::FindValue(FindValueResult::Value(reader.blob()?)),
            FIND_VALUE_CONTACTS => {
                Response::FindValue(FindValueResult::Contacts(reader.contacts()?))
            }
            tag => return Err(DecodeError::InvalidTag(tag)),
        },
        Opcode::CheckFileExists => Response::CheckFileExists(reader.file_status()?),
        Opcode::DownloadFile => Response::DownloadFile(FileChunk {
            status: reader.file_status()?,
            data: reader.blob()?,
        }),
    })
}

// ----------------------------------------------------------------------------//

fn put_str(buf: &mut BytesMut, value: &str) {
    // Callers validate lengths at the API boundary, truncate defensively otherwise.
    let bytes = &value.as_bytes()[..value.len().min(u16::MAX as usize)];
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn put_blob(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_acknowledge(buf: &mut BytesMut, ack: &Acknowledge) {
    buf.put_u16(ack.protocol_version);
    buf.put_u16(ack.buckets.len() as u16);
    for bucket in &ack.buckets {
        put_str(buf, bucket);
    }
}

fn put_file_query(buf: &mut BytesMut, query: &FileQuery) {
    put_str(buf, &query.bucket);
    put_str(buf, &query.prefix);
    put_str(buf, &query.name);
}

fn put_file_status(buf: &mut BytesMut, status: &FileStatus) {
    buf.put_u8(status.bucket_found as u8);
    buf.put_u8(status.exists as u8);
    buf.put_u64(status.size);
    put_str(buf, &status.version);
}

fn put_contacts(buf: &mut BytesMut, contacts: &[ContactInfo]) {
    let count = contacts.len().min(u16::MAX as usize);
    buf.put_u16(count as u16);

    for contact in &contacts[..count] {
        buf.put_slice(contact.id.as_ref());
        put_str(buf, &contact.machine_id);

        match contact.addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_slice(&ip.octets());
            }
        }

        buf.put_u16(contact.addr.port());
    }
}

/// Bounds-checked cursor over a received buffer.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < len {
            return Err(DecodeError::Truncated);
        }

        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        // Length checked by `take`.
        self.take(N)?.try_into().map_err(|_| DecodeError::Truncated)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn id(&mut self) -> Result<Identifier, DecodeError> {
        Ok(Identifier::from(self.array::<ID_LEN>()?))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;

        if !bytes.is_ascii() {
            return Err(DecodeError::NonAscii);
        }

        // ASCII is always valid UTF-8.
        Ok(bytes.iter().map(|b| *b as char).collect())
    }

    fn blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn acknowledge(&mut self) -> Result<Acknowledge, DecodeError> {
        let protocol_version = self.u16()?;
        let count = self.u16()?;
        let buckets = (0..count)
            .map(|_| self.string())
            .collect::<Result<_, _>>()?;

        Ok(Acknowledge {
            protocol_version,
            buckets,
        })
    }

    fn file_query(&mut self) -> Result<FileQuery, DecodeError> {
        Ok(FileQuery {
            bucket: self.string()?,
            prefix: self.string()?,
            name: self.string()?,
        })
    }

    fn file_status(&mut self) -> Result<FileStatus, DecodeError> {
        Ok(FileStatus {
            bucket_found: self.bool()?,
            exists: self.bool()?,
            size: self.u64()?,
            version: self.string()?,
        })
    }

    fn contacts(&mut self) -> Result<Vec<ContactInfo>, DecodeError> {
        let count = self.u16()?;
        let mut contacts = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let id = self.id()?;
            let machine_id = self.string()?;
            let ip = match self.u8()? {
                4 => IpAddr::V4(Ipv4Addr::from(self.array::<4>()?)),
                6 => IpAddr::V6(Ipv6Addr::from(self.array::<16>()?)),
                family => return Err(DecodeError::InvalidFamily(family)),
            };
            let port = self.u16()?;

            contacts.push(ContactInfo::new(id, machine_id, SocketAddr::new(ip, port)));
        }

        Ok(contacts)
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn sender() -> Sender {
        Sender {
            id: test::dummy_identifier(),
            tcp_port: 17500,
            machine_id: "workstation-7".to_owned(),
        }
    }

    #[test]
    fn positive_announcement_layout() {
        let announcement = Announcement {
            correlation_id: 0x01020304,
            protocol_version: 1,
            tcp_port: 17500,
            machine_id: "ab".to_owned(),
        };

        let encoded = announcement.encode();

        assert_eq!(
            encoded,
            vec![1, 2, 3, 4, 0, 1, 0x44, 0x5c, 0, 2, b'a', b'b']
        );
        assert_eq!(Announcement::decode(&encoded), Ok(announcement));
    }

    #[test]
    fn negative_truncated_announcement() {
        let encoded = Announcement {
            correlation_id: 7,
            protocol_version: 1,
            tcp_port: 17500,
            machine_id: "machine".to_owned(),
        }
        .encode();

        for len in 0..encoded.len() {
            assert_eq!(
                Announcement::decode(&encoded[..len]),
                Err(DecodeError::Truncated)
            );
        }
    }

    #[test]
    fn negative_non_ascii_machine_id() {
        let mut encoded = Announcement {
            correlation_id: 7,
            protocol_version: 1,
            tcp_port: 17500,
            machine_id: "xy".to_owned(),
        }
        .encode();
        let last = encoded.len() - 1;
        encoded[last] = 0xff;

        assert_eq!(Announcement::decode(&encoded), Err(DecodeError::NonAscii));
    }

    #[test]
    fn positive_request_header_layout() {
        let message = Message {
            correlation_id: 42,
            sender: sender(),
            body: MessageBody::Request(Request::Ping),
        };

        let encoded = message.encode();

        assert_eq!(encoded[0], Opcode::Ping as u8);
        assert_eq!(encoded[1], 0);
        assert_eq!(&encoded[2..6], &42u32.to_be_bytes());
        assert_eq!(&encoded[6..6 + ID_LEN], message.sender.id.as_ref());
        assert_eq!(Message::decode(&encoded), Ok(message));
    }

    #[test]
    fn positive_download_response_roundtrip() {
        let message = Message {
            correlation_id: 9,
            sender: sender(),
            body: MessageBody::Response(Response::DownloadFile(FileChunk {
                status: FileStatus {
                    bucket_found: true,
                    exists: true,
                    size: 1 << 40,
                    version: "1697040000000000000".to_owned(),
                },
                data: vec![7u8; 300],
            })),
        };

        assert_eq!(Message::decode(&message.encode()), Ok(message));
    }

    #[test]
    fn positive_contacts_of_both_families() {
        let contacts = vec![
            ContactInfo::new(
                test::dummy_identifier(),
                "v4",
                "192.168.1.20:17500".parse().unwrap(),
            ),
            ContactInfo::new(
                Identifier::random(),
                "v6",
                "[fe80::1]:17501".parse().unwrap(),
            ),
        ];
        let message = Message {
            correlation_id: 1,
            sender: sender(),
            body: MessageBody::Response(Response::FindValue(FindValueResult::Contacts(
                contacts.clone(),
            ))),
        };

        match Message::decode(&message.encode()).unwrap().body {
            MessageBody::Response(Response::FindValue(FindValueResult::Contacts(decoded))) => {
                assert_eq!(decoded.len(), 2);
                for (a, b) in decoded.iter().zip(contacts.iter()) {
                    assert_eq!(a.id, b.id);
                    assert_eq!(a.addr, b.addr);
                    assert_eq!(a.machine_id, b.machine_id);
                }
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn positive_error_flag() {
        let message = Message {
            correlation_id: 3,
            sender: sender(),
            body: MessageBody::Error(Opcode::Store, "storage full".to_owned()),
        };

        let encoded = message.encode();

        assert_eq!(encoded[1], FLAG_RESPONSE | FLAG_ERROR);
        assert_eq!(Message::decode(&encoded), Ok(message));
    }

    #[test]
    fn negative_unknown_opcode() {
        let mut encoded = Message {
            correlation_id: 3,
            sender: sender(),
            body: MessageBody::Request(Request::Ping),
        }
        .encode();
        encoded[0] = 0xee;

        assert_eq!(Message::decode(&encoded), Err(DecodeError::UnknownOpcode(0xee)));
    }

    #[test]
    fn negative_inverted_range() {
        let mut encoded = Message {
            correlation_id: 3,
            sender: sender(),
            body: MessageBody::Request(Request::DownloadFile(ChunkRequest {
                file: FileQuery {
                    bucket: "b".to_owned(),
                    prefix: String::new(),
                    name: "n".to_owned(),
                },
                range: ByteRange::new(0, 10),
            })),
        }
        .encode();
        // Overwrite `start` (second to last u64) with a value beyond `end`.
        let start_at = encoded.len() - 16;
        encoded[start_at..start_at + 8].copy_from_slice(&100u64.to_be_bytes());

        assert_eq!(Message::decode(&encoded), Err(DecodeError::InvalidRange(100, 10)));
    }

    #[test]
    fn negative_download_range_longer_than_a_frame() {
        let mut encoded = Message {
            correlation_id: 2,
            sender: sender(),
            body: MessageBody::Request(Request::DownloadFile(ChunkRequest {
                file: FileQuery {
                    bucket: "docs".to_owned(),
                    prefix: String::new(),
                    name: "a.txt".to_owned(),
                },
                range: ByteRange::new(0, 10),
            })),
        }
        .encode();
        let end_at = encoded.len() - 8;
        encoded[end_at..].copy_from_slice(&u64::MAX.to_be_bytes());

        assert_eq!(
            Message::decode(&encoded),
            Err(DecodeError::InvalidRange(0, u64::MAX))
        );

        let end = MAX_FRAME_LEN as u64;
        encoded[end_at..].copy_from_slice(&end.to_be_bytes());

        assert_eq!(
            Message::decode(&encoded),
            Err(DecodeError::InvalidRange(0, end))
        );
    }

    #[test]
    fn negative_trailing_bytes() {
        let mut encoded = Message {
            correlation_id: 3,
            sender: sender(),
            body: MessageBody::Request(Request::Ping),
        }
        .encode();
        encoded.push(0);

        assert_eq!(Message::decode(&encoded), Err(DecodeError::TrailingBytes(1)));
    }
}
