//! AppleSingle container: one stream holding a data fork plus the
//! auxiliary forks and metadata a classic Mac OS file carries.

use thiserror::Error;

const MAGIC: u32 = 0x0005_1600;
const VERSION: u32 = 0x0002_0000;
const HEADER_LENGTH: usize = 26;
const ENTRY_DESCRIPTOR_LENGTH: usize = 12;

const DATA_FORK_ID: u32 = 1;
const RESOURCE_FORK_ID: u32 = 2;
const REAL_NAME_ID: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppleSingleError {
    #[error("Not an AppleSingle stream")]
    BadMagic,
    #[error("Unsupported AppleSingle version {0:#x}")]
    BadVersion(u32),
    #[error("Truncated AppleSingle stream")]
    Truncated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppleSingle {
    pub data_fork: Vec<u8>,
    pub resource_fork: Option<Vec<u8>>,
    pub real_name: Option<String>,
}

impl AppleSingle {
    pub fn encode(&self) -> Vec<u8> {
        let mut entries: Vec<(u32, &[u8])> = vec![];
        if let Some(real_name) = &self.real_name {
            entries.push((REAL_NAME_ID, real_name.as_bytes()));
        }
        if let Some(resource_fork) = &self.resource_fork {
            entries.push((RESOURCE_FORK_ID, resource_fork));
        }
        entries.push((DATA_FORK_ID, &self.data_fork));

        let mut output = Vec::with_capacity(
            HEADER_LENGTH
                + entries.len() * ENTRY_DESCRIPTOR_LENGTH
                + entries.iter().map(|(_, content)| content.len()).sum::<usize>(),
        );
        output.extend_from_slice(&MAGIC.to_be_bytes());
        output.extend_from_slice(&VERSION.to_be_bytes());
        output.extend_from_slice(&[0u8; 16]);
        output.extend_from_slice(&(entries.len() as u16).to_be_bytes());

        let mut offset = HEADER_LENGTH + entries.len() * ENTRY_DESCRIPTOR_LENGTH;
        for (id, content) in &entries {
            output.extend_from_slice(&id.to_be_bytes());
            output.extend_from_slice(&(offset as u32).to_be_bytes());
            output.extend_from_slice(&(content.len() as u32).to_be_bytes());
            offset += content.len();
        }
        for (_, content) in entries {
            output.extend_from_slice(content);
        }

        output
    }

    pub fn decode(raw: &[u8]) -> Result<Self, AppleSingleError> {
        if raw.len() < HEADER_LENGTH {
            return Err(AppleSingleError::Truncated);
        }
        if read_u32(raw, 0)? != MAGIC {
            return Err(AppleSingleError::BadMagic);
        }
        let version = read_u32(raw, 4)?;
        if version != VERSION {
            return Err(AppleSingleError::BadVersion(version));
        }

        let count = u16::from_be_bytes([raw[24], raw[25]]) as usize;
        let mut decoded = AppleSingle::default();
        for index in 0..count {
            let descriptor = HEADER_LENGTH + index * ENTRY_DESCRIPTOR_LENGTH;
            let id = read_u32(raw, descriptor)?;
            let offset = read_u32(raw, descriptor + 4)? as usize;
            let length = read_u32(raw, descriptor + 8)? as usize;
            let content = raw
                .get(offset..offset + length)
                .ok_or(AppleSingleError::Truncated)?;

            match id {
                DATA_FORK_ID => decoded.data_fork = content.to_vec(),
                RESOURCE_FORK_ID => decoded.resource_fork = Some(content.to_vec()),
                REAL_NAME_ID => {
                    decoded.real_name = Some(String::from_utf8_lossy(content).to_string())
                }
                other => log::debug!("Skip AppleSingle entry {}", other),
            }
        }

        Ok(decoded)
    }
}

fn read_u32(raw: &[u8], at: usize) -> Result<u32, AppleSingleError> {
    let bytes = raw.get(at..at + 4).ok_or(AppleSingleError::Truncated)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
