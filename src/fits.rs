use crate::error::{Result, StackError};
use fitrs::{Fits, FitsData, HeaderValue, Hdu};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
/// Don't read more than 36 header blocks (~100 KB) before giving up on END
const MAX_HEADER_BLOCKS: usize = 36;

/// Metadata extracted from a FITS file
#[derive(Debug, serde::Serialize)]
pub struct FitsMetadata {
    pub filename: String,
    pub primary_header: HashMap<String, String>,
    pub image_info: Option<ImageInfo>,
    /// Bytes taken by the header blocks
    #[serde(skip)]
    pub header_len: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageInfo {
    pub width: usize,
    pub height: usize,
    pub bit_depth: i32,
    pub dimensions: Vec<usize>,
}

impl ImageInfo {
    /// Size of the primary data unit in bytes, unpadded
    pub fn data_len(&self) -> usize {
        let bytes = (self.bit_depth.unsigned_abs() / 8) as usize;
        self.dimensions.iter().product::<usize>() * bytes
    }
}

impl FitsMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.primary_header.get(key).map(|s| s.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse::<f64>().ok())
    }
}

/// Read and validate the primary header. Fails for anything that is not a
/// FITS file or whose header is not terminated.
pub fn read_fits_metadata(path: &Path) -> Result<FitsMetadata> {
    let mut file = File::open(path)?;

    let mut header_data = Vec::new();
    let mut terminated = false;
    while header_data.len() < MAX_HEADER_BLOCKS * BLOCK_SIZE {
        let mut block = vec![0u8; BLOCK_SIZE];
        if file.read_exact(&mut block).is_err() {
            break;
        }
        if header_data.is_empty() && !block.starts_with(b"SIMPLE") {
            return Err(StackError::raster(path, "missing SIMPLE card, not a FITS file"));
        }
        terminated = block
            .chunks(CARD_SIZE)
            .any(|card| card.starts_with(b"END") && card[3..].iter().all(|&b| b == b' '));
        header_data.extend_from_slice(&block);
        if terminated {
            break;
        }
    }

    if header_data.is_empty() {
        return Err(StackError::raster(path, "file shorter than one FITS block"));
    }
    if !terminated {
        return Err(StackError::raster(path, "FITS header has no END card"));
    }

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let keywords = parse_fits_header(&header_data);

    let mut image_info = None;
    if let Some(naxis) = keywords.get("NAXIS").and_then(|s| s.parse::<usize>().ok()) {
        let dimensions: Vec<usize> = (1..=naxis)
            .filter_map(|i| {
                keywords
                    .get(&format!("NAXIS{}", i))
                    .and_then(|s| s.parse::<usize>().ok())
            })
            .collect();

        if dimensions.len() >= 2 {
            let bit_depth = keywords
                .get("BITPIX")
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0);
            image_info = Some(ImageInfo {
                width: dimensions[0],
                height: dimensions[1],
                bit_depth,
                dimensions,
            });
        }
    }

    Ok(FitsMetadata {
        filename,
        primary_header: keywords,
        image_info,
        header_len: header_data.len(),
    })
}

/// Parse 80-character FITS header cards into a keyword map
fn parse_fits_header(data: &[u8]) -> HashMap<String, String> {
    let mut keywords = HashMap::new();

    for chunk in data.chunks(CARD_SIZE) {
        let Ok(card) = std::str::from_utf8(chunk) else {
            continue;
        };
        let card = card.trim();

        if card == "END" {
            break;
        }
        if card.is_empty() || card.starts_with("COMMENT") || card.starts_with("HISTORY") {
            continue;
        }

        // KEYWORD = VALUE / COMMENT
        if let Some(eq_pos) = card.find('=') {
            let keyword = card[..eq_pos].trim();
            let value_part = card[eq_pos + 1..].trim();

            // A quoted string may itself contain '/'
            let value = if let Some(rest) = value_part.strip_prefix('\'') {
                rest.find('\'').map(|end| &rest[..end]).unwrap_or(rest)
            } else if let Some(comment_pos) = value_part.find('/') {
                &value_part[..comment_pos]
            } else {
                value_part
            };

            if !keyword.is_empty() {
                keywords.insert(keyword.to_string(), value.trim().to_string());
            }
        }
    }

    keywords
}

/// Validate that a file is a 2-D FITS image whose data unit is complete.
pub fn validate_image_file(path: &Path) -> Result<(FitsMetadata, ImageInfo)> {
    let metadata = read_fits_metadata(path)?;
    let info = metadata
        .image_info
        .clone()
        .ok_or_else(|| StackError::raster(path, "primary HDU holds no 2-D image"))?;

    if info.dimensions.len() != 2 {
        return Err(StackError::raster(
            path,
            format!(
                "expected a single CFA plane, found shape {:?}",
                info.dimensions
            ),
        ));
    }
    if !matches!(info.bit_depth, 8 | 16 | 32 | -32 | -64) {
        return Err(StackError::raster(
            path,
            format!("unsupported BITPIX {}", info.bit_depth),
        ));
    }

    let file_len = std::fs::metadata(path)?.len() as usize;
    let needed = metadata.header_len + info.data_len();
    if file_len < needed {
        return Err(StackError::raster(
            path,
            format!("truncated data unit: {} bytes, {} needed", file_len, needed),
        ));
    }

    Ok((metadata, info))
}

/// Read the primary image as physical values (BZERO/BSCALE applied).
pub fn read_image_data(path: &Path, info: &ImageInfo, metadata: &FitsMetadata) -> Result<Vec<f32>> {
    let fits = Fits::open(path)
        .map_err(|e| StackError::raster(path, format!("failed to open FITS file: {}", e)))?;
    let hdu = fits
        .get(0)
        .ok_or_else(|| StackError::raster(path, "no primary HDU found"))?;

    let bzero = metadata.get_f64("BZERO").unwrap_or(0.0);
    let bscale = metadata.get_f64("BSCALE").unwrap_or(1.0);
    let physical = |raw: f64| (raw * bscale + bzero) as f32;

    let data: Vec<f32> = match hdu.read_data() {
        FitsData::Characters(_) => {
            return Err(StackError::raster(path, "character data, not an image"));
        }
        FitsData::IntegersI32(array) => array
            .data
            .iter()
            .map(|v| match v {
                Some(raw) => physical(*raw as f64),
                None => 0.0,
            })
            .collect(),
        // fitrs only yields unsigned data once it has applied the 2^31 offset itself
        FitsData::IntegersU32(array) => array
            .data
            .iter()
            .map(|v| match v {
                Some(raw) => (*raw as f64 * bscale) as f32,
                None => 0.0,
            })
            .collect(),
        FitsData::FloatingPoint32(array) => array.data.iter().map(|&v| physical(v as f64)).collect(),
        FitsData::FloatingPoint64(array) => array.data.iter().map(|&v| physical(v)).collect(),
    };

    if data.len() != info.width * info.height {
        return Err(StackError::raster(
            path,
            format!(
                "data size mismatch: expected {} pixels, got {}",
                info.width * info.height,
                data.len()
            ),
        ));
    }

    Ok(data)
}

/// Header value for a produced artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Card {
    Int(i32),
    Float(f64),
    Text(String),
}

impl From<Card> for HeaderValue {
    fn from(card: Card) -> Self {
        match card {
            Card::Int(v) => HeaderValue::IntegerNumber(v),
            Card::Float(v) => HeaderValue::RealFloatingNumber(v),
            Card::Text(v) => HeaderValue::CharacterString(v),
        }
    }
}

/// Keys never passed from input frames to outputs: color management and
/// anything describing the input data layout.
pub fn is_carried_key(key: &str) -> bool {
    const STRUCTURAL: &[&str] = &[
        "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "EXTEND", "BZERO", "BSCALE",
        "END", "BAYERPAT", "XBAYROFF", "YBAYROFF", "IMAGETYP",
    ];
    let upper = key.to_uppercase();
    if STRUCTURAL.contains(&upper.as_str()) {
        return false;
    }
    !(upper.starts_with("ICC") || upper.contains("PROFILE") || upper.starts_with("COLORSP"))
}

/// Write a 32-bit float image. `shape` is FITS axis order (width, height[, planes]).
pub fn write_f32_image(
    path: &Path,
    shape: &[usize],
    data: Vec<f32>,
    cards: &[(String, Card)],
) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(StackError::raster(
            path,
            format!("refusing to write {} values into shape {:?}", data.len(), shape),
        ));
    }

    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let mut hdu = Hdu::new(shape, data);
    for (key, value) in cards {
        hdu.insert(key.as_str(), HeaderValue::from(value.clone()));
    }
    Fits::create(path, hdu)
        .map_err(|e| StackError::raster(path, format!("failed to write FITS file: {}", e)))?;
    Ok(())
}

/// Format FITS metadata for display
pub fn format_fits_metadata(metadata: &FitsMetadata, verbose: bool) -> String {
    let mut output = String::new();

    output.push_str(&format!("FITS File: {}\n", metadata.filename));

    if let Some(ref img_info) = metadata.image_info {
        output.push_str("\nImage Information:\n");
        output.push_str(&format!(
            "  Dimensions: {} x {}\n",
            img_info.width, img_info.height
        ));
        output.push_str(&format!("  Bit Depth: {}\n", img_info.bit_depth));
        if img_info.dimensions.len() > 2 {
            output.push_str(&format!("  Full Shape: {:?}\n", img_info.dimensions));
        }
    }

    output.push_str("\nKey Metadata:\n");
    let labelled: &[(&str, &[&str])] = &[
        ("Type", &["IMAGETYP", "FRAME"]),
        ("Date", &["DATE-OBS"]),
        ("Object", &["OBJECT", "OBJNAME"]),
        ("Exposure (s)", &["EXPTIME", "EXPOSURE"]),
        ("Bayer Pattern", &["BAYERPAT"]),
        ("Filter", &["FILTER", "FILTERNAME"]),
        ("Telescope", &["TELESCOP"]),
        ("Instrument", &["INSTRUME"]),
        ("Gain", &["GAIN"]),
        ("Sensor Temp", &["CCD-TEMP"]),
        ("Frames Combined", &["NCOMBINE"]),
        ("Drizzle Kernel", &["DRZKERN"]),
    ];
    for (label, keys) in labelled {
        if let Some(value) = keys.iter().find_map(|k| metadata.get(k)) {
            output.push_str(&format!("  {}: {}\n", label, value));
        }
    }

    if verbose {
        output.push_str("\nAll Keywords:\n");
        let mut sorted_keys: Vec<_> = metadata.primary_header.iter().collect();
        sorted_keys.sort_by_key(|&(k, _)| k);
        for (key, value) in sorted_keys {
            output.push_str(&format!("  {:<16} = {}\n", key, value));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn card(text: &str) -> Vec<u8> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(CARD_SIZE, b' ');
        bytes
    }

    fn header_block(cards: &[&str]) -> Vec<u8> {
        let mut data: Vec<u8> = cards.iter().flat_map(|c| card(c)).collect();
        data.extend(card("END"));
        let padded = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        data.resize(padded, b' ');
        data
    }

    #[test]
    fn test_parse_header_values() {
        let block = header_block(&[
            "SIMPLE  =                    T",
            "BITPIX  =                   16 / bits per pixel",
            "BAYERPAT= 'GBRG    '           / Bayer pattern",
            "OBJECT  = 'M 27 / Dumbbell'",
            "COMMENT this is ignored",
        ]);
        let keywords = parse_fits_header(&block);
        assert_eq!(keywords.get("BITPIX").map(String::as_str), Some("16"));
        assert_eq!(keywords.get("BAYERPAT").map(String::as_str), Some("GBRG"));
        assert_eq!(
            keywords.get("OBJECT").map(String::as_str),
            Some("M 27 / Dumbbell")
        );
        assert!(!keywords.contains_key("COMMENT"));
    }

    #[test]
    fn test_rejects_non_fits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.fits");
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0x49u8; BLOCK_SIZE]).unwrap();
        assert!(read_fits_metadata(&path).is_err());
    }

    #[test]
    fn test_rejects_truncated_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.fits");
        let block = header_block(&[
            "SIMPLE  =                    T",
            "BITPIX  =                   16",
            "NAXIS   =                    2",
            "NAXIS1  =                  100",
            "NAXIS2  =                  100",
        ]);
        let mut file = File::create(&path).unwrap();
        file.write_all(&block).unwrap();
        file.write_all(&[0u8; 100]).unwrap();

        let err = validate_image_file(&path).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_write_then_read_float_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plane.fit");
        let data: Vec<f32> = (0..12).map(|v| v as f32 * 0.5).collect();
        write_f32_image(
            &path,
            &[4, 3],
            data.clone(),
            &[("EXPTIME".to_string(), Card::Float(10.0))],
        )
        .unwrap();

        let (metadata, info) = validate_image_file(&path).unwrap();
        assert_eq!((info.width, info.height, info.bit_depth), (4, 3, -32));
        assert_eq!(metadata.get_f64("EXPTIME"), Some(10.0));
        let read = read_image_data(&path, &info, &metadata).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_color_management_keys_are_not_carried() {
        assert!(is_carried_key("OBJECT"));
        assert!(is_carried_key("TELESCOP"));
        assert!(!is_carried_key("ICCPROF"));
        assert!(!is_carried_key("BAYERPAT"));
        assert!(!is_carried_key("NAXIS1"));
    }
}
