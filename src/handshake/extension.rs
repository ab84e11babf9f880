use nom::bytes::complete::take;
use nom::multi::many0;
use nom::number::complete::be_u16;
use nom::IResult;

use crate::types::AlertDescription;

pub(crate) const RECORD_SIZE_LIMIT: u16 = 0x001C;

/// Smallest and largest value a peer may announce in record_size_limit.
pub(crate) const RECORD_SIZE_LIMIT_MIN: u16 = 64;
pub(crate) const RECORD_SIZE_LIMIT_MAX: u16 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extension<'a> {
    pub extension_type: u16,
    pub data: &'a [u8],
}

impl<'a> Extension<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Extension<'a>> {
        let (input, extension_type) = be_u16(input)?;
        let (input, len) = be_u16(input)?;
        let (input, data) = take(len)(input)?;
        Ok((input, Extension { extension_type, data }))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.extension_type.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(self.data);
    }
}

/// Parse the contents of an extensions block, without its length prefix.
pub(crate) fn parse_extensions(block: &[u8]) -> Result<Vec<Extension<'_>>, AlertDescription> {
    match many0(Extension::parse)(block) {
        Ok((rest, list)) if rest.is_empty() => Ok(list),
        _ => Err(AlertDescription::DecodeError),
    }
}

/// Find and validate record_size_limit. Unknown extensions are skipped.
pub(crate) fn record_size_limit(extensions: &[Extension<'_>]) -> Result<Option<u16>, AlertDescription> {
    let Some(ext) = extensions
        .iter()
        .find(|e| e.extension_type == RECORD_SIZE_LIMIT)
    else {
        return Ok(None);
    };

    if ext.data.len() != 2 {
        return Err(AlertDescription::IllegalParameter);
    }
    let value = u16::from_be_bytes([ext.data[0], ext.data[1]]);
    if !(RECORD_SIZE_LIMIT_MIN..=RECORD_SIZE_LIMIT_MAX).contains(&value) {
        return Err(AlertDescription::IllegalParameter);
    }
    Ok(Some(value))
}

/// Serialize an extensions block with its length prefix.
pub(crate) fn serialize_extensions(out: &mut Vec<u8>, extensions: &[Extension<'_>]) {
    let start = out.len();
    out.extend_from_slice(&[0, 0]);
    for ext in extensions {
        ext.serialize(out);
    }
    let len = (out.len() - start - 2) as u16;
    out[start..start + 2].copy_from_slice(&len.to_be_bytes());
}
