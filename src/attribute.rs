//! Attribute catalogue and typed decoding of attribute values.
//!
//! Every beacon exposes one GATT service with a fixed set of characteristics.
//! The identifiers are versioned by the beacon firmware.

use crate::beacon::TerminalKind;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// The beacon's primary service, also used as the scan filter.
pub const BEACON_SERVICE: Uuid = Uuid::from_u128(0xC1FB6CDA_3F15_4BC0_8A46_8E9C341065F8);

/// Width of the fixed serial-number and location fields.
pub const TEXT_FIELD_LEN: usize = 41;

/// Value written to the user-disconnect attribute.
pub const USER_DISCONNECT_VALUE: [u8; 1] = [0x01];

/// A characteristic of the beacon service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    CardData,
    StickyConnect,
    TerminalKind,
    UserDisconnect,
    SerialNumber,
    Location,
    AssetNumber,
    Denomination,
    LinkActive,
    RfPowerLevel,
}

impl Attribute {
    pub const ALL: [Attribute; 10] = [
        Attribute::CardData,
        Attribute::StickyConnect,
        Attribute::TerminalKind,
        Attribute::UserDisconnect,
        Attribute::SerialNumber,
        Attribute::Location,
        Attribute::AssetNumber,
        Attribute::Denomination,
        Attribute::LinkActive,
        Attribute::RfPowerLevel,
    ];

    /// Attributes that must be satisfied before a connection is announced.
    pub const REQUIRED: [Attribute; 4] = [
        Attribute::CardData,
        Attribute::StickyConnect,
        Attribute::TerminalKind,
        Attribute::UserDisconnect,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Attribute::CardData => Uuid::from_u128(0x60D11359_FEB2_411D_A430_CA6167052BD6),
            Attribute::StickyConnect => Uuid::from_u128(0x4B6A91D8_EA3E_42A4_B39B_B300F5F64C86),
            Attribute::TerminalKind => Uuid::from_u128(0xD308DFDE_9F06_4A73_A2C7_EB952E40A184),
            Attribute::UserDisconnect => Uuid::from_u128(0x4E3A829D_4830_47A0_995F_EE923710A469),
            Attribute::SerialNumber => Uuid::from_u128(0x2A6F4B1E_5C0D_4E8B_9F27_61C3D8A40B15),
            Attribute::Location => Uuid::from_u128(0x2A6F4B1E_5C0D_4E8B_9F27_61C3D8A40B16),
            Attribute::AssetNumber => Uuid::from_u128(0x2A6F4B1E_5C0D_4E8B_9F27_61C3D8A40B17),
            Attribute::Denomination => Uuid::from_u128(0x2A6F4B1E_5C0D_4E8B_9F27_61C3D8A40B18),
            Attribute::LinkActive => Uuid::from_u128(0x2A6F4B1E_5C0D_4E8B_9F27_61C3D8A40B19),
            Attribute::RfPowerLevel => Uuid::from_u128(0x2A6F4B1E_5C0D_4E8B_9F27_61C3D8A40B1A),
        }
    }

    /// Look up a catalogued attribute by its wire identifier.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.uuid() == uuid)
    }

    /// Whether the attribute can be read. Only the disconnect trigger cannot.
    pub fn is_readable(self) -> bool {
        !matches!(self, Attribute::UserDisconnect)
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Attribute::CardData | Attribute::UserDisconnect | Attribute::RfPowerLevel
        )
    }

    pub fn supports_notify(self) -> bool {
        matches!(self, Attribute::LinkActive)
    }

    pub fn is_required(self) -> bool {
        Self::REQUIRED.contains(&self)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Attribute::CardData => "card_data",
            Attribute::StickyConnect => "sticky_connect",
            Attribute::TerminalKind => "terminal_kind",
            Attribute::UserDisconnect => "user_disconnect",
            Attribute::SerialNumber => "serial_number",
            Attribute::Location => "location",
            Attribute::AssetNumber => "asset_number",
            Attribute::Denomination => "denomination",
            Attribute::LinkActive => "link_active",
            Attribute::RfPowerLevel => "rf_power_level",
        };
        f.write_str(name)
    }
}

/// Transmit power setting of the beacon radio, 0 (lowest) to 3 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RfPowerLevel(u8);

impl RfPowerLevel {
    pub const MAX: u8 = 3;

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for RfPowerLevel {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(DecodeError::UnexpectedValue {
                attribute: Attribute::RfPowerLevel,
                value,
            })
        }
    }
}

impl fmt::Display for RfPowerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    CardData(String),
    StickyConnect(bool),
    TerminalKind(TerminalKind),
    SerialNumber(String),
    Location(String),
    AssetNumber(u32),
    Denomination(u32),
    LinkActive(bool),
    RfPowerLevel(RfPowerLevel),
}

impl AttributeValue {
    pub fn attribute(&self) -> Attribute {
        match self {
            AttributeValue::CardData(_) => Attribute::CardData,
            AttributeValue::StickyConnect(_) => Attribute::StickyConnect,
            AttributeValue::TerminalKind(_) => Attribute::TerminalKind,
            AttributeValue::SerialNumber(_) => Attribute::SerialNumber,
            AttributeValue::Location(_) => Attribute::Location,
            AttributeValue::AssetNumber(_) => Attribute::AssetNumber,
            AttributeValue::Denomination(_) => Attribute::Denomination,
            AttributeValue::LinkActive(_) => Attribute::LinkActive,
            AttributeValue::RfPowerLevel(_) => Attribute::RfPowerLevel,
        }
    }
}

/// Errors raised while decoding a received attribute value.
///
/// These never reach listeners: the value is logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{attribute}: expected at least {expected} bytes, got {actual}")]
    TooShort {
        attribute: Attribute,
        expected: usize,
        actual: usize,
    },
    #[error("{attribute}: value {value} is out of range")]
    UnexpectedValue { attribute: Attribute, value: u8 },
    #[error("{0}: value is not valid UTF-8")]
    InvalidText(Attribute),
    #[error("{0}: attribute carries no readable value")]
    NotReadable(Attribute),
}

/// Decode the raw bytes received for `attribute`.
///
/// Text fields are UTF-8 and cut at the first zero byte. Numeric fields are
/// little-endian. Flags are a single byte where `1` means set.
pub fn decode(attribute: Attribute, bytes: &[u8]) -> Result<AttributeValue, DecodeError> {
    match attribute {
        Attribute::CardData => Ok(AttributeValue::CardData(text(attribute, bytes)?)),
        Attribute::StickyConnect => Ok(AttributeValue::StickyConnect(flag(attribute, bytes)?)),
        Attribute::TerminalKind => Ok(AttributeValue::TerminalKind(TerminalKind::from_reported(
            &text(attribute, bytes)?,
        ))),
        Attribute::SerialNumber => Ok(AttributeValue::SerialNumber(fixed_text(attribute, bytes)?)),
        Attribute::Location => Ok(AttributeValue::Location(fixed_text(attribute, bytes)?)),
        Attribute::AssetNumber => Ok(AttributeValue::AssetNumber(le_u32(attribute, bytes)?)),
        Attribute::Denomination => Ok(AttributeValue::Denomination(le_u32(attribute, bytes)?)),
        Attribute::LinkActive => Ok(AttributeValue::LinkActive(flag(attribute, bytes)?)),
        Attribute::RfPowerLevel => {
            let byte = first_byte(attribute, bytes)?;
            Ok(AttributeValue::RfPowerLevel(RfPowerLevel::try_from(byte)?))
        }
        Attribute::UserDisconnect => Err(DecodeError::NotReadable(attribute)),
    }
}

fn first_byte(attribute: Attribute, bytes: &[u8]) -> Result<u8, DecodeError> {
    bytes.first().copied().ok_or(DecodeError::TooShort {
        attribute,
        expected: 1,
        actual: 0,
    })
}

fn flag(attribute: Attribute, bytes: &[u8]) -> Result<bool, DecodeError> {
    Ok(first_byte(attribute, bytes)? == 1)
}

fn text(attribute: Attribute, bytes: &[u8]) -> Result<String, DecodeError> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map(str::to_string)
        .map_err(|_| DecodeError::InvalidText(attribute))
}

fn fixed_text(attribute: Attribute, bytes: &[u8]) -> Result<String, DecodeError> {
    let field = &bytes[..bytes.len().min(TEXT_FIELD_LEN)];
    Ok(text(attribute, field)?.trim_end().to_string())
}

fn le_u32(attribute: Attribute, bytes: &[u8]) -> Result<u32, DecodeError> {
    let raw: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::TooShort {
            attribute,
            expected: 4,
            actual: bytes.len(),
        })?;
    Ok(u32::from_le_bytes(raw))
}
