//! Conversions between raw octet buffers and the shared buffer type.
//!
//! Every value that crosses a task boundary is carried as [`Bytes`], so the
//! caller's slice can be reused as soon as a conversion returns.

use bytes::{BufMut, Bytes, BytesMut};

/// Copy a caller-owned slice into an owned, cheaply clonable buffer.
#[must_use]
pub fn to_buffer(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(data)
}

/// Copy a buffer back into a plain vector for the client-facing layer.
#[must_use]
pub fn from_buffer(buffer: &Bytes) -> Vec<u8> {
    buffer.to_vec()
}

/// Encode a 16-bit company identifier the way it appears on the air.
///
/// Company identifiers are little-endian in advertisement payloads.
#[must_use]
pub fn company_id_bytes(company_id: u16) -> [u8; 2] {
    company_id.to_le_bytes()
}

/// Build the manufacturer-data prefix reported with a scan result.
///
/// The first two bytes are the company identifier, followed by the payload.
///
/// # Examples
///
/// ```
/// use quickblue_types::codec::manufacturer_data_head;
///
/// let head = manufacturer_data_head(0x004c, &[0x02, 0x15]);
/// assert_eq!(head, vec![0x4c, 0x00, 0x02, 0x15]);
/// ```
#[must_use]
pub fn manufacturer_data_head(company_id: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_slice(&company_id_bytes(company_id));
    buf.put_slice(data);
    buf.to_vec()
}

/// Format bytes as lowercase hex, mainly for log fields.
#[must_use]
pub fn to_hex_string(data: &[u8]) -> String {
    use core::fmt::Write;

    data.iter().fold(String::with_capacity(data.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
