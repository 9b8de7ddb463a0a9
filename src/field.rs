//! Schema-driven bit-field codec.
//!
//! A [`Template`] names every field of a wire structure together with its
//! width in bits. Fields are packed back to back, least significant bit
//! first: a field starting at bit offset `n` occupies bit `n % 8` of byte
//! `n / 8` upwards, so byte-aligned multi-byte integers come out
//! little-endian, which is what IPMI uses on the wire.
//!
//! A [`FieldObject`] is a buffer bound to one template. Values are written
//! and read by name; the object never interprets them.

use core::fmt;

use crate::error::{Error, Result};

/// How a field participates in encoding and decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Always present; decoding fails when the buffer ends before it.
    Required,
    /// May be absent at the end of a buffer, but never partially present.
    Optional,
    /// Trailing byte-aligned field; the declared width is the maximum.
    Variable,
}

/// One named field of a [`Template`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name, unique within its template.
    pub name: &'static str,
    /// Width in bits (maximum width for [`Presence::Variable`]).
    pub bits: u32,
    /// Presence policy.
    pub presence: Presence,
}

impl FieldSpec {
    /// A field that must always be present.
    pub const fn required(name: &'static str, bits: u32) -> Self {
        Self {
            name,
            bits,
            presence: Presence::Required,
        }
    }

    /// A field that may be missing at the end of a buffer.
    pub const fn optional(name: &'static str, bits: u32) -> Self {
        Self {
            name,
            bits,
            presence: Presence::Optional,
        }
    }

    /// A trailing field of up to `max_bits` bits.
    pub const fn variable(name: &'static str, max_bits: u32) -> Self {
        Self {
            name,
            bits: max_bits,
            presence: Presence::Variable,
        }
    }
}

/// An immutable, ordered list of field descriptors.
///
/// Templates are meant to be `const` items. Structural mistakes (zero-width
/// fields, a required field after an optional one, a variable field that is
/// not last or not byte aligned) are rejected while the constant is
/// evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    fields: &'static [FieldSpec],
}

impl Template {
    /// Build a template from its field list.
    pub const fn new(fields: &'static [FieldSpec]) -> Self {
        let mut i = 0;
        let mut offset = 0u32;
        let mut relaxed = false;
        while i < fields.len() {
            let field = fields[i];
            assert!(field.bits > 0, "zero-width field");
            match field.presence {
                Presence::Required => {
                    assert!(!relaxed, "required field after an optional field");
                }
                Presence::Optional => relaxed = true,
                Presence::Variable => {
                    assert!(i + 1 == fields.len(), "variable field must be last");
                    assert!(
                        offset % 8 == 0 && field.bits % 8 == 0,
                        "variable field must be byte aligned"
                    );
                    relaxed = true;
                }
            }
            offset += field.bits;
            i += 1;
        }
        Self { fields }
    }

    /// Field descriptors in wire order.
    pub fn fields(&self) -> &'static [FieldSpec] {
        self.fields
    }

    /// Maximum encoded length in bits.
    pub fn len_bits(&self) -> usize {
        self.fields.iter().map(|f| f.bits as usize).sum()
    }

    /// Maximum encoded length in bytes.
    ///
    /// Fails when the template does not describe a whole number of bytes.
    pub fn len_bytes(&self) -> Result<usize> {
        let bits = self.len_bits();
        if bits % 8 != 0 {
            return Err(Error::InvalidArgument(
                "template length is not a whole number of bytes",
            ));
        }
        Ok(bits / 8)
    }

    /// Bit offset of a field from the start of the structure.
    pub fn field_offset_bits(&self, name: &str) -> Result<usize> {
        self.locate(name).map(|(_, offset, _)| offset)
    }

    /// Declared width of a field in bits.
    pub fn field_len_bits(&self, name: &str) -> Result<usize> {
        self.locate(name).map(|(_, _, spec)| spec.bits as usize)
    }

    fn locate(&self, name: &str) -> Result<(usize, usize, FieldSpec)> {
        let mut offset = 0usize;
        for (index, spec) in self.fields.iter().enumerate() {
            if spec.name == name {
                return Ok((index, offset, *spec));
            }
            offset += spec.bits as usize;
        }
        Err(Error::UnknownField(name.to_string()))
    }
}

/// Encoded length of `template` in bytes.
pub fn field_length_bytes(template: &Template) -> Result<usize> {
    template.len_bytes()
}

/// Encode `values` (name, value) with `template`.
///
/// Every required field must be named; optional fields are emitted up to the
/// first one left out.
pub fn encode(template: Template, values: &[(&str, u64)]) -> Result<Vec<u8>> {
    let mut obj = FieldObject::new(template);
    for (name, value) in values {
        obj.set(name, *value)?;
    }
    obj.to_bytes()
}

/// Decode `bytes` with `template`.
pub fn decode(template: Template, bytes: &[u8]) -> Result<FieldObject> {
    let mut obj = FieldObject::new(template);
    obj.set_all(bytes)?;
    Ok(obj)
}

/// A buffer bound to a [`Template`].
#[derive(Clone, PartialEq, Eq)]
pub struct FieldObject {
    template: Template,
    buf: Vec<u8>,
    // Bits currently held by each field, `None` when unset.
    lens: Vec<Option<usize>>,
}

impl FieldObject {
    /// Create an empty object for `template`.
    pub fn new(template: Template) -> Self {
        Self {
            template,
            buf: vec![0u8; template.len_bits().div_ceil(8)],
            lens: vec![None; template.fields.len()],
        }
    }

    /// Template this object is bound to.
    pub fn template(&self) -> Template {
        self.template
    }

    /// Unset every field.
    pub fn clear(&mut self) {
        self.buf.fill(0);
        self.lens.fill(None);
    }

    /// Whether a field currently holds a value.
    pub fn is_set(&self, name: &str) -> Result<bool> {
        let (index, _, _) = self.template.locate(name)?;
        Ok(self.lens[index].is_some())
    }

    /// Store an integer value in a field of at most 64 bits.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let (index, offset, spec) = self.template.locate(name)?;
        if spec.bits > 64 {
            return Err(Error::InvalidArgument(
                "field wider than 64 bits must be set as data",
            ));
        }
        if spec.presence == Presence::Variable {
            return Err(Error::InvalidArgument(
                "variable-length field must be set as data",
            ));
        }
        if spec.bits < 64 && value >> spec.bits != 0 {
            return Err(Error::FieldOverflow {
                field: spec.name,
                bits: spec.bits,
                value,
            });
        }

        write_bits(&mut self.buf, offset, spec.bits as usize, value);
        self.lens[index] = Some(spec.bits as usize);
        Ok(())
    }

    /// Read an integer field of at most 64 bits.
    pub fn get(&self, name: &str) -> Result<u64> {
        let (index, offset, spec) = self.template.locate(name)?;
        let len = self.lens[index].ok_or(Error::FieldNotSet(spec.name))?;
        if len > 64 {
            return Err(Error::InvalidArgument(
                "field wider than 64 bits must be read as data",
            ));
        }
        Ok(read_bits(&self.buf, offset, len))
    }

    /// Store raw bytes in a byte-aligned field.
    ///
    /// Fixed fields take exactly their width; variable fields take up to
    /// their maximum.
    pub fn set_data(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let (index, offset, spec) = self.template.locate(name)?;
        if offset % 8 != 0 || spec.bits % 8 != 0 {
            return Err(Error::InvalidArgument("field is not byte aligned"));
        }

        let width = spec.bits as usize / 8;
        let fits = match spec.presence {
            Presence::Variable => data.len() <= width,
            Presence::Required | Presence::Optional => data.len() == width,
        };
        if !fits {
            return Err(Error::FieldLength {
                field: spec.name,
                expected: data.len() * 8,
                available: spec.bits as usize,
            });
        }

        let start = offset / 8;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.lens[index] = Some(data.len() * 8);
        Ok(())
    }

    /// Borrow the bytes held by a byte-aligned field.
    pub fn get_data(&self, name: &str) -> Result<&[u8]> {
        let (index, offset, spec) = self.template.locate(name)?;
        if offset % 8 != 0 || spec.bits % 8 != 0 {
            return Err(Error::InvalidArgument("field is not byte aligned"));
        }
        let len = self.lens[index].ok_or(Error::FieldNotSet(spec.name))?;
        let start = offset / 8;
        Ok(&self.buf[start..start + len / 8])
    }

    /// Replace the contents of the object by decoding `bytes`.
    ///
    /// Returns the number of bytes consumed. On error the object is left
    /// empty.
    pub fn set_all(&mut self, bytes: &[u8]) -> Result<usize> {
        self.clear();

        let available = bytes.len() * 8;
        let mut lens = vec![None; self.template.fields.len()];
        let mut offset = 0usize;

        for (index, spec) in self.template.fields.iter().enumerate() {
            let bits = spec.bits as usize;
            let remaining = available.saturating_sub(offset);
            let len = match spec.presence {
                Presence::Required => bits,
                Presence::Optional if remaining == 0 => break,
                Presence::Optional => bits,
                Presence::Variable if remaining == 0 => break,
                Presence::Variable => remaining.min(bits),
            };
            if remaining < len {
                return Err(Error::FieldLength {
                    field: spec.name,
                    expected: len,
                    available: remaining,
                });
            }
            lens[index] = Some(len);
            offset += len;
        }

        let consumed = offset.div_ceil(8);
        if consumed < bytes.len() {
            return Err(Error::TrailingBytes {
                extra: bytes.len() - consumed,
            });
        }

        self.buf[..consumed].copy_from_slice(&bytes[..consumed]);
        self.lens = lens;
        Ok(consumed)
    }

    /// Encode the fields that are set.
    ///
    /// Required fields must all be set, and set fields must form a prefix of
    /// the template.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut offset = 0usize;
        let mut gap: Option<&'static str> = None;

        for (spec, len) in self.template.fields.iter().zip(&self.lens) {
            match (len, gap) {
                (Some(_), Some(missing)) => return Err(Error::FieldNotSet(missing)),
                (Some(len), None) => offset += len,
                (None, _) if spec.presence == Presence::Required => {
                    return Err(Error::FieldNotSet(spec.name));
                }
                (None, None) => gap = Some(spec.name),
                (None, Some(_)) => {}
            }
        }

        if offset % 8 != 0 {
            return Err(Error::InvalidArgument(
                "encoded fields do not end on a byte boundary",
            ));
        }
        Ok(self.buf[..offset / 8].to_vec())
    }
}

impl fmt::Debug for FieldObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        let mut offset = 0usize;
        for (spec, len) in self.template.fields.iter().zip(&self.lens) {
            match len {
                Some(len) if *len <= 64 => {
                    map.entry(&spec.name, &read_bits(&self.buf, offset, *len));
                }
                Some(len) => {
                    map.entry(&spec.name, &format_args!("<{} bytes>", len / 8));
                }
                None => {}
            }
            offset += spec.bits as usize;
        }
        map.finish()
    }
}

fn read_bits(buf: &[u8], offset: usize, width: usize) -> u64 {
    let mut value = 0u64;
    let mut done = 0usize;
    while done < width {
        let pos = offset + done;
        let shift = pos % 8;
        let take = (8 - shift).min(width - done);
        let mask = ((1u16 << take) - 1) as u8;
        let chunk = (buf[pos / 8] >> shift) & mask;
        value |= u64::from(chunk) << done;
        done += take;
    }
    value
}

fn write_bits(buf: &mut [u8], offset: usize, width: usize, value: u64) {
    let mut done = 0usize;
    while done < width {
        let pos = offset + done;
        let shift = pos % 8;
        let take = (8 - shift).min(width - done);
        let mask = (((1u16 << take) - 1) as u8) << shift;
        let chunk = ((value >> done) as u8) << shift;
        let byte = &mut buf[pos / 8];
        *byte = (*byte & !mask) | (chunk & mask);
        done += take;
    }
}
