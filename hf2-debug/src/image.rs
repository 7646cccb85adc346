//! Binary images handed to the flashing link.
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use ihex::Record;
use serde::{Deserialize, Serialize};

/// A contiguous run of bytes to be written at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    pub address: u32,
    pub data: Vec<u8>,
}

impl FlashBlock {
    fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }
}

/// The compiled program as a list of blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryImage {
    pub blocks: Vec<FlashBlock>,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Failed to read image file")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse Intel HEX record")]
    IhexRead(#[from] ihex::ReaderError),
    #[error("Failed to decode UF2 image: {0}")]
    Uf2(String),
    #[error("The image contains no loadable data")]
    NoLoadableSegments,
    #[error("Image data at {0:#x} does not fit into the 32-bit address space")]
    AddressOverflow(u64),
    #[error("Unknown image format '{0}' (supported: bin, hex, uf2)")]
    UnknownFormat(String),
}

/// A finite list of the image formats that can be flashed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Raw flash contents, placed at a base address.
    Bin,
    /// [Intel HEX](https://en.wikipedia.org/wiki/Intel_HEX).
    Hex,
    /// [UF2](https://github.com/microsoft/uf2), the format HF2 bootloaders ship with.
    #[default]
    Uf2,
}

impl ImageFormat {
    /// Guesses the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|extension| extension.to_str())
            .and_then(|extension| Self::from_str(extension).ok())
    }
}

impl FromStr for ImageFormat {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase()[..] {
            "bin" | "binary" => Ok(Self::Bin),
            "hex" | "ihex" | "intelhex" => Ok(Self::Hex),
            "uf2" => Ok(Self::Uf2),
            other => Err(ImageError::UnknownFormat(other.to_string())),
        }
    }
}

impl BinaryImage {
    /// Loads an image from disk.
    ///
    /// Without an explicit `format` the file extension decides, falling back to UF2.
    pub fn load(
        path: &Path,
        format: Option<ImageFormat>,
        base_address: u32,
    ) -> Result<Self, ImageError> {
        let format = format
            .or_else(|| ImageFormat::from_path(path))
            .unwrap_or_default();
        let data = std::fs::read(path)?;

        tracing::debug!("Loading {:?} as {:?}", path, format);

        match format {
            ImageFormat::Bin => Self::from_bin(base_address, data),
            ImageFormat::Hex => Self::from_hex(&String::from_utf8_lossy(&data)),
            ImageFormat::Uf2 => Self::from_uf2(&data),
        }
    }

    pub fn from_bin(base_address: u32, data: Vec<u8>) -> Result<Self, ImageError> {
        let mut image = Self::default();
        image.add_data(base_address as u64, &data)?;
        Ok(image)
    }

    pub fn from_hex(data: &str) -> Result<Self, ImageError> {
        let mut image = Self::default();
        let mut base_address = 0u64;

        for record in ihex::Reader::new(data) {
            match record? {
                Record::Data { offset, value } => {
                    image.add_data(base_address + offset as u64, &value)?;
                }
                Record::ExtendedSegmentAddress(address) => {
                    base_address = (address as u64) * 16;
                }
                Record::ExtendedLinearAddress(address) => {
                    base_address = (address as u64) << 16;
                }
                Record::EndOfFile
                | Record::StartSegmentAddress { .. }
                | Record::StartLinearAddress(_) => {}
            }
        }

        if image.blocks.is_empty() {
            return Err(ImageError::NoLoadableSegments);
        }
        Ok(image)
    }

    pub fn from_uf2(data: &[u8]) -> Result<Self, ImageError> {
        let (converted, family_to_target) = uf2_decode::convert_from_uf2(data)
            .map_err(|error| ImageError::Uf2(format!("{error:?}")))?;

        let Some(target_address) = family_to_target.values().min() else {
            tracing::warn!("No loadable segments were found in the UF2 file.");
            return Err(ImageError::NoLoadableSegments);
        };
        if family_to_target.len() > 1 {
            tracing::warn!("More than 1 section found in UF2 file. Using first section.");
        }

        let address = u64::from(*target_address);
        let mut image = Self::default();
        image.add_data(address, &converted)?;
        Ok(image)
    }

    /// Appends data, merging it into the previous block when it is contiguous.
    pub fn add_data(&mut self, address: u64, data: &[u8]) -> Result<(), ImageError> {
        let end = address + data.len() as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(ImageError::AddressOverflow(address));
        }

        match self.blocks.last_mut() {
            Some(last) if last.end() == address => last.data.extend_from_slice(data),
            _ => self.blocks.push(FlashBlock {
                address: address as u32,
                data: data.to_vec(),
            }),
        }
        Ok(())
    }

    /// Total number of payload bytes.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|block| block.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits the image into aligned pages of `page_size` bytes.
    ///
    /// Bytes not covered by any block are filled with `0xff`, the erased flash value.
    pub fn pages(&self, page_size: usize) -> Vec<(u32, Vec<u8>)> {
        let page_size = page_size.max(1) as u64;
        let mut pages: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

        for block in &self.blocks {
            for (offset, byte) in block.data.iter().enumerate() {
                let address = block.address as u64 + offset as u64;
                let page_address = address - address % page_size;
                let page = pages
                    .entry(page_address)
                    .or_insert_with(|| vec![0xff; page_size as usize]);
                page[(address - page_address) as usize] = *byte;
            }
        }

        pages
            .into_iter()
            .map(|(address, data)| (address as u32, data))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_format() {
        assert_eq!(ImageFormat::from_str("hex").unwrap(), ImageFormat::Hex);
        assert_eq!(ImageFormat::from_str("IHex").unwrap(), ImageFormat::Hex);
        assert_eq!(ImageFormat::from_str("Binary").unwrap(), ImageFormat::Bin);
        assert_eq!(ImageFormat::from_str("UF2").unwrap(), ImageFormat::Uf2);
        assert!(ImageFormat::from_str("elf").is_err());
        assert_eq!(
            ImageFormat::from_path(Path::new("built/binary.hex")),
            Some(ImageFormat::Hex)
        );
    }

    #[test]
    fn contiguous_data_is_merged() {
        let mut image = BinaryImage::default();
        image.add_data(0x100, &[1, 2]).unwrap();
        image.add_data(0x102, &[3]).unwrap();
        image.add_data(0x200, &[4]).unwrap();

        assert_eq!(
            image.blocks,
            vec![
                FlashBlock {
                    address: 0x100,
                    data: vec![1, 2, 3]
                },
                FlashBlock {
                    address: 0x200,
                    data: vec![4]
                },
            ]
        );
        assert_eq!(image.len(), 4);
    }

    #[test]
    fn hex_records_honour_extended_addresses() {
        let hex = ":020000040800F2\n:0400000001020304F2\n:00000001FF";
        let image = BinaryImage::from_hex(hex).unwrap();

        assert_eq!(
            image.blocks,
            vec![FlashBlock {
                address: 0x0800_0000,
                data: vec![1, 2, 3, 4]
            }]
        );
    }

    #[test]
    fn pages_are_aligned_and_padded() {
        let image = BinaryImage::from_bin(0x1002, vec![0xaa, 0xbb, 0xcc]).unwrap();

        assert_eq!(
            image.pages(4),
            vec![
                (0x1000, vec![0xff, 0xff, 0xaa, 0xbb]),
                (0x1004, vec![0xcc, 0xff, 0xff, 0xff]),
            ]
        );
    }

    #[test]
    fn data_past_the_address_space_is_rejected() {
        assert!(matches!(
            BinaryImage::from_bin(0xffff_fffe, vec![0; 4]),
            Err(ImageError::AddressOverflow(_))
        ));
    }
}
