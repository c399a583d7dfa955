//! Protobuf messages of the contact sync stream.
//!
//! Field numbers follow the sync message format; fields this engine does not
//! use (color, verified, profile key, blocked, archived) are skipped by the
//! decoder as unknown fields.

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContactDetailsProto {
    #[prost(string, optional, tag = "1")]
    pub contact_e164: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub avatar: Option<AvatarProto>,
    #[prost(uint32, optional, tag = "8")]
    pub expire_timer: Option<u32>,
    #[prost(string, optional, tag = "9")]
    pub aci: Option<String>,
    #[prost(uint32, optional, tag = "10")]
    pub inbox_position: Option<u32>,
    #[prost(uint32, optional, tag = "12")]
    pub expire_timer_version: Option<u32>,
}

/// Avatar header; `length` raw bytes follow the record in the stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AvatarProto {
    #[prost(string, optional, tag = "1")]
    pub content_type: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub length: Option<u32>,
}
