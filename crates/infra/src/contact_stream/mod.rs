//! Streaming decoder for contact sync payloads.
//!
//! A payload is a sequence of records, each a varint length prefix followed by
//! a `ContactDetails` protobuf message. A record that announces an avatar is
//! followed by that many raw avatar bytes. The decoder walks an owned buffer
//! with a bounds-checked cursor and yields one record at a time, so callers
//! can hold at most one batch of decoded records in memory.

use std::iter::FusedIterator;

use bytes::{Bytes, BytesMut};
use prost::Message;

use contactsync_core::{Aci, E164};

mod proto;

pub use proto::{AvatarProto, ContactDetailsProto};

/// Records merged per transaction.
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Upper bound for a single encoded record (excluding its avatar).
pub const MAX_RECORD_LEN: usize = 1 << 20;

/// Upper bound for an inline avatar.
pub const MAX_AVATAR_LEN: usize = 8 << 20;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid length prefix at offset {offset}")]
    InvalidLengthPrefix { offset: usize },
    #[error("record at offset {offset} declares {declared} bytes but only {remaining} remain")]
    Truncated {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("record at offset {offset} declares {declared} bytes (limit {limit})")]
    TooLarge {
        offset: usize,
        declared: usize,
        limit: usize,
    },
    #[error("malformed contact record at offset {offset}: {source}")]
    Malformed {
        offset: usize,
        #[source]
        source: prost::DecodeError,
    },
}

/// One decoded contact.
///
/// Unparsable identifiers are dropped to `None` while decoding; a record
/// without any identifier is still returned and left to the caller to skip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactDetails {
    pub aci: Option<Aci>,
    pub phone_number: Option<E164>,
    pub name: Option<String>,
    pub inbox_position: Option<u32>,
    pub expire_timer: Option<u32>,
    pub expire_timer_version: Option<u32>,
}

impl ContactDetails {
    pub fn has_identifier(&self) -> bool {
        self.aci.is_some() || self.phone_number.is_some()
    }

    fn from_proto(proto: ContactDetailsProto, offset: usize) -> Self {
        let aci = proto.aci.as_deref().and_then(|raw| {
            raw.parse::<Aci>()
                .map_err(|e| tracing::warn!(offset, error = %e, "dropping unparsable ACI"))
                .ok()
        });
        let phone_number = proto.contact_e164.as_deref().and_then(|raw| {
            E164::parse(raw)
                .map_err(|e| tracing::warn!(offset, error = %e, "dropping unparsable phone number"))
                .ok()
        });

        Self {
            aci,
            phone_number,
            name: proto.name.filter(|name| !name.trim().is_empty()),
            inbox_position: proto.inbox_position,
            expire_timer: proto.expire_timer,
            expire_timer_version: proto.expire_timer_version,
        }
    }

    fn to_proto(&self, avatar_len: Option<u32>) -> ContactDetailsProto {
        ContactDetailsProto {
            contact_e164: self.phone_number.as_ref().map(|p| p.as_str().to_string()),
            name: self.name.clone(),
            avatar: avatar_len.map(|length| AvatarProto {
                content_type: Some("image/jpeg".to_string()),
                length: Some(length),
            }),
            expire_timer: self.expire_timer,
            aci: self.aci.map(|aci| aci.to_string()),
            inbox_position: self.inbox_position,
            expire_timer_version: self.expire_timer_version,
        }
    }
}

/// Single forward pass over a contact sync payload.
///
/// After the first error the decoder is exhausted: `decode_next` returns
/// `Ok(None)` and the iterator returns `None`.
#[derive(Debug)]
pub struct ContactStreamDecoder {
    buf: Bytes,
    offset: usize,
    records: usize,
    failed: bool,
}

impl ContactStreamDecoder {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self {
            buf: buf.into(),
            offset: 0,
            records: 0,
            failed: false,
        }
    }

    /// Number of records decoded so far.
    pub fn records_decoded(&self) -> usize {
        self.records
    }

    /// Decode exactly one record, or return `Ok(None)` at end of stream.
    pub fn decode_next(&mut self) -> Result<Option<ContactDetails>, DecodeError> {
        if self.failed || self.offset >= self.buf.len() {
            return Ok(None);
        }

        match self.decode_record() {
            Ok(details) => {
                self.records += 1;
                Ok(Some(details))
            }
            Err(err) => {
                self.failed = true;
                self.offset = self.buf.len();
                Err(err)
            }
        }
    }

    /// Decode up to `batch_size` records; an empty batch means end of stream.
    pub fn next_batch(&mut self, batch_size: usize) -> Result<Vec<ContactDetails>, DecodeError> {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match self.decode_next()? {
                Some(details) => batch.push(details),
                None => break,
            }
        }
        Ok(batch)
    }

    fn decode_record(&mut self) -> Result<ContactDetails, DecodeError> {
        let start = self.offset;
        let mut cursor = &self.buf[start..];
        let declared = prost::decode_length_delimiter(&mut cursor)
            .map_err(|_| DecodeError::InvalidLengthPrefix { offset: start })?;

        let body_start = self.buf.len() - cursor.len();
        let body_end = checked_end(start, body_start, declared, self.buf.len(), MAX_RECORD_LEN)?;

        let proto = ContactDetailsProto::decode(self.buf.slice(body_start..body_end))
            .map_err(|source| DecodeError::Malformed {
                offset: start,
                source,
            })?;

        let mut end = body_end;
        if let Some(avatar_len) = proto.avatar.as_ref().and_then(|a| a.length) {
            end = checked_end(start, end, avatar_len as usize, self.buf.len(), MAX_AVATAR_LEN)?;
        }

        self.offset = end;
        Ok(ContactDetails::from_proto(proto, start))
    }
}

fn checked_end(
    offset: usize,
    from: usize,
    declared: usize,
    buf_len: usize,
    limit: usize,
) -> Result<usize, DecodeError> {
    if declared > limit {
        return Err(DecodeError::TooLarge {
            offset,
            declared,
            limit,
        });
    }
    let remaining = buf_len - from;
    if declared > remaining {
        return Err(DecodeError::Truncated {
            offset,
            declared,
            remaining,
        });
    }
    Ok(from + declared)
}

impl Iterator for ContactStreamDecoder {
    type Item = Result<ContactDetails, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next().transpose()
    }
}

impl FusedIterator for ContactStreamDecoder {}

/// Encoder for the same framing, as produced by the primary device.
#[derive(Debug, Default)]
pub struct ContactStreamWriter {
    buf: BytesMut,
}

impl ContactStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record, followed by its avatar bytes if any.
    pub fn write(&mut self, contact: &ContactDetails, avatar: Option<&[u8]>) {
        let avatar = avatar.filter(|bytes| !bytes.is_empty());
        let avatar_len = avatar.map(|bytes| bytes.len() as u32);
        self.buf
            .extend_from_slice(&contact.to_proto(avatar_len).encode_length_delimited_to_vec());
        if let Some(bytes) = avatar {
            self.buf.extend_from_slice(bytes);
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
