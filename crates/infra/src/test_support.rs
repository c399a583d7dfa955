//! Shared fixtures for unit tests.

use uuid::Uuid;

use contactsync_core::{Aci, E164, LocalIdentifiers};

use crate::contact_stream::{ContactDetails, ContactStreamWriter};

pub(crate) const LOCAL_NUMBER: &str = "+15550000000";

/// Deterministic ACI for fixture number `n`.
pub(crate) fn aci(n: u128) -> Aci {
    Aci::from_uuid(Uuid::from_u128(0x5157_0000_0000_0000_0000_0000_0000_0000 + n))
}

pub(crate) fn phone(raw: &str) -> E164 {
    E164::parse(raw).unwrap()
}

pub(crate) fn local_identifiers() -> LocalIdentifiers {
    LocalIdentifiers::new(aci(0), phone(LOCAL_NUMBER))
}

pub(crate) fn contact(aci: Option<Aci>, phone_number: Option<&str>) -> ContactDetails {
    ContactDetails {
        aci,
        phone_number: phone_number.map(phone),
        ..ContactDetails::default()
    }
}

pub(crate) fn encode(contacts: &[ContactDetails]) -> bytes::Bytes {
    let mut writer = ContactStreamWriter::new();
    for contact in contacts {
        writer.write(contact, None);
    }
    writer.finish()
}
