//! Minimal GeoTIFF reader: header, first IFD, georeferencing and sample data.
//!
//! Supports classic TIFF and BigTIFF in either byte order. Pixel data is only
//! decoded for statistics, and only for uncompressed or deflate chunks without
//! a predictor; other layouts report no statistics.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::ZlibDecoder;
use thiserror::Error;

use granule_common::BoundingBox;

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PLANAR_CONFIGURATION: u16 = 284;
const TAG_PREDICTOR: u16 = 317;
const TAG_TILE_WIDTH: u16 = 322;
const TAG_TILE_LENGTH: u16 = 323;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

const GEOKEY_MODEL_TYPE: u16 = 1024;
const GEOKEY_GEOGRAPHIC_TYPE: u16 = 2048;
const GEOKEY_PROJECTED_CS_TYPE: u16 = 3072;
const GEOKEY_USER_DEFINED: u16 = 32767;

const COMPRESSION_NONE: u16 = 1;
const COMPRESSION_DEFLATE: u16 = 8;
const COMPRESSION_DEFLATE_LEGACY: u16 = 32946;

/// Refuse to allocate for absurd entry counts in corrupt files.
const MAX_VALUES: u64 = 1 << 28;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TiffError {
    #[error("Not a TIFF file")]
    NotTiff,

    /// More bytes are needed; `needed` is the minimum prefix length to retry with.
    #[error("Truncated TIFF: need at least {needed} bytes")]
    Truncated { needed: usize },

    #[error("Malformed TIFF: {0}")]
    Malformed(String),

    #[error("TIFF is not georeferenced: {0}")]
    NotGeoreferenced(String),

    #[error("Unsupported TIFF layout: {0}")]
    Unsupported(String),
}

type TiffResult<T> = Result<T, TiffError>;

/// Sample data type, named as in the STAC raster extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float32,
    Float64,
}

impl DataType {
    fn from_format(sample_format: u16, bits: u16) -> TiffResult<Self> {
        Ok(match (sample_format, bits) {
            (1, 8) => DataType::UInt8,
            (1, 16) => DataType::UInt16,
            (1, 32) => DataType::UInt32,
            (1, 64) => DataType::UInt64,
            (2, 8) => DataType::Int8,
            (2, 16) => DataType::Int16,
            (2, 32) => DataType::Int32,
            (2, 64) => DataType::Int64,
            (3, 32) => DataType::Float32,
            (3, 64) => DataType::Float64,
            other => {
                return Err(TiffError::Unsupported(format!(
                    "sample format {} with {} bits",
                    other.0, other.1
                )))
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::UInt8 => "uint8",
            DataType::Int8 => "int8",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::UInt32 => "uint32",
            DataType::Int32 => "int32",
            DataType::UInt64 => "uint64",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }

    pub fn size(self) -> usize {
        match self {
            DataType::UInt8 | DataType::Int8 => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::UInt64 | DataType::Int64 | DataType::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandStatistics {
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub stddev: f64,
    pub valid_percent: f64,
}

/// Georeferencing and sample layout from the first IFD.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoTiffHeader {
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    pub data_type: DataType,
    pub nodata: Option<f64>,
    pub epsg: Option<u32>,
    /// Affine `[a, b, c, d, e, f]` with `x = a*col + b*row + c`, `y = d*col + e*row + f`.
    pub transform: [f64; 6],
    /// Extent in the native CRS.
    pub bbox: BoundingBox,
    pub compression: u16,
    pub predictor: u16,
    /// 1 = chunky (interleaved), 2 = one plane per band.
    pub planar: u16,
}

#[derive(Debug, Clone, Copy)]
struct RawEntry {
    field_type: u16,
    count: u64,
    /// Position of the inline value / offset field.
    value_pos: usize,
}

struct Reader<'a> {
    data: &'a [u8],
    little_endian: bool,
    big_tiff: bool,
}

impl<'a> Reader<'a> {
    fn slice(&self, offset: usize, len: usize) -> TiffResult<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| TiffError::Malformed("offset overflow".into()))?;
        self.data
            .get(offset..end)
            .ok_or(TiffError::Truncated { needed: end })
    }

    fn array<const N: usize>(&self, offset: usize) -> TiffResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(offset, N)?);
        if self.little_endian == cfg!(target_endian = "big") {
            out.reverse();
        }
        Ok(out)
    }

    fn u16(&self, offset: usize) -> TiffResult<u16> {
        Ok(u16::from_ne_bytes(self.array(offset)?))
    }

    fn u32(&self, offset: usize) -> TiffResult<u32> {
        Ok(u32::from_ne_bytes(self.array(offset)?))
    }

    fn u64(&self, offset: usize) -> TiffResult<u64> {
        Ok(u64::from_ne_bytes(self.array(offset)?))
    }

    fn offset(&self, pos: usize) -> TiffResult<usize> {
        let value = if self.big_tiff {
            self.u64(pos)?
        } else {
            u64::from(self.u32(pos)?)
        };
        usize::try_from(value).map_err(|_| TiffError::Malformed("offset too large".into()))
    }

    fn type_size(field_type: u16) -> TiffResult<usize> {
        Ok(match field_type {
            1 | 2 | 6 | 7 => 1,
            3 | 8 => 2,
            4 | 9 | 11 => 4,
            5 | 10 | 12 | 16 | 17 | 18 => 8,
            other => return Err(TiffError::Malformed(format!("unknown field type {}", other))),
        })
    }

    /// Start of an entry's value bytes and their total length.
    fn locate(&self, entry: &RawEntry) -> TiffResult<(usize, usize)> {
        if entry.count > MAX_VALUES {
            return Err(TiffError::Malformed(format!("entry count {} too large", entry.count)));
        }
        let len = Self::type_size(entry.field_type)? * entry.count as usize;
        let inline = if self.big_tiff { 8 } else { 4 };
        let start = if len <= inline {
            entry.value_pos
        } else {
            self.offset(entry.value_pos)?
        };
        Ok((start, len))
    }

    fn values_f64(&self, entry: &RawEntry) -> TiffResult<Vec<f64>> {
        let (start, _) = self.locate(entry)?;
        let size = Self::type_size(entry.field_type)?;
        (0..entry.count as usize)
            .map(|i| {
                let pos = start + i * size;
                Ok(match entry.field_type {
                    1 | 7 => f64::from(self.slice(pos, 1)?[0]),
                    6 => f64::from(self.slice(pos, 1)?[0] as i8),
                    3 => f64::from(self.u16(pos)?),
                    8 => f64::from(self.u16(pos)? as i16),
                    4 => f64::from(self.u32(pos)?),
                    9 => f64::from(self.u32(pos)? as i32),
                    11 => f64::from(f32::from_bits(self.u32(pos)?)),
                    12 => f64::from_bits(self.u64(pos)?),
                    16 | 18 => self.u64(pos)? as f64,
                    17 => self.u64(pos)? as i64 as f64,
                    5 => f64::from(self.u32(pos)?) / f64::from(self.u32(pos + 4)?.max(1)),
                    10 => f64::from(self.u32(pos)? as i32) / f64::from((self.u32(pos + 4)? as i32).max(1)),
                    other => return Err(TiffError::Malformed(format!("non-numeric field type {}", other))),
                })
            })
            .collect()
    }

    fn values_u64(&self, entry: &RawEntry) -> TiffResult<Vec<u64>> {
        let (start, _) = self.locate(entry)?;
        let size = Self::type_size(entry.field_type)?;
        (0..entry.count as usize)
            .map(|i| {
                let pos = start + i * size;
                match entry.field_type {
                    1 | 7 => Ok(u64::from(self.slice(pos, 1)?[0])),
                    3 => Ok(u64::from(self.u16(pos)?)),
                    4 => Ok(u64::from(self.u32(pos)?)),
                    16 | 18 => self.u64(pos),
                    other => Err(TiffError::Malformed(format!("non-integer field type {}", other))),
                }
            })
            .collect()
    }

    fn ascii(&self, entry: &RawEntry) -> TiffResult<String> {
        let (start, len) = self.locate(entry)?;
        let bytes = self.slice(start, len)?;
        Ok(String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }
}

/// Parsed first IFD, borrowing the bytes it was read from.
pub struct GeoTiff<'a> {
    reader: Reader<'a>,
    entries: BTreeMap<u16, RawEntry>,
    pub header: GeoTiffHeader,
}

impl<'a> GeoTiff<'a> {
    /// Parse the header and georeferencing. `data` may be a prefix of the file;
    /// `TiffError::Truncated` tells how much more is needed.
    pub fn parse(data: &'a [u8]) -> TiffResult<Self> {
        let little_endian = match data.get(0..2) {
            Some(b"II") => true,
            Some(b"MM") => false,
            Some(_) => return Err(TiffError::NotTiff),
            None => return Err(TiffError::Truncated { needed: 16 }),
        };
        let mut reader = Reader {
            data,
            little_endian,
            big_tiff: false,
        };

        let ifd_offset = match reader.u16(2)? {
            42 => reader.u32(4)? as usize,
            43 => {
                if reader.u16(4)? != 8 {
                    return Err(TiffError::Malformed("BigTIFF offset size must be 8".into()));
                }
                reader.big_tiff = true;
                usize::try_from(reader.u64(8)?)
                    .map_err(|_| TiffError::Malformed("IFD offset too large".into()))?
            }
            _ => return Err(TiffError::NotTiff),
        };

        let entries = read_ifd(&reader, ifd_offset)?;
        let header = build_header(&reader, &entries)?;
        Ok(Self {
            reader,
            entries,
            header,
        })
    }

    /// Per-band statistics over all pixels, or `None` when the chunk encoding
    /// is not supported. Requires the complete file.
    pub fn statistics(&self) -> TiffResult<Option<Vec<Option<BandStatistics>>>> {
        let h = &self.header;
        let compressed = match h.compression {
            COMPRESSION_NONE => false,
            COMPRESSION_DEFLATE | COMPRESSION_DEFLATE_LEGACY => true,
            _ => return Ok(None),
        };
        if h.predictor != 1 {
            return Ok(None);
        }

        let (offsets_tag, counts_tag, chunk_w, chunk_h) = if self.entries.contains_key(&TAG_TILE_OFFSETS) {
            (
                TAG_TILE_OFFSETS,
                TAG_TILE_BYTE_COUNTS,
                self.first_u64(TAG_TILE_WIDTH)?.unwrap_or(0) as usize,
                self.first_u64(TAG_TILE_LENGTH)?.unwrap_or(0) as usize,
            )
        } else {
            let rows = self
                .first_u64(TAG_ROWS_PER_STRIP)?
                .unwrap_or(u64::from(h.height))
                .min(u64::from(h.height));
            (TAG_STRIP_OFFSETS, TAG_STRIP_BYTE_COUNTS, h.width as usize, rows as usize)
        };
        if chunk_w == 0 || chunk_h == 0 {
            return Err(TiffError::Malformed("zero chunk size".into()));
        }

        let offsets = self.required_u64(offsets_tag)?;
        let counts = self.required_u64(counts_tag)?;
        if offsets.len() != counts.len() {
            return Err(TiffError::Malformed("chunk offset/count length mismatch".into()));
        }

        let width = h.width as usize;
        let height = h.height as usize;
        let bands = h.bands as usize;
        let across = width.div_ceil(chunk_w);
        let down = height.div_ceil(chunk_h);
        let (planes, samples_per_pixel) = if h.planar == 2 { (bands, 1) } else { (1, bands) };
        let sample_size = h.data_type.size();

        let oversized = || TiffError::Malformed("chunk layout exceeds addressable size".into());
        let per_plane = across.checked_mul(down).ok_or_else(oversized)?;
        let chunk_count = per_plane.checked_mul(planes).ok_or_else(oversized)?;
        let chunk_bytes = chunk_w
            .checked_mul(chunk_h)
            .and_then(|n| n.checked_mul(samples_per_pixel))
            .and_then(|n| n.checked_mul(sample_size))
            .ok_or_else(oversized)?;
        if offsets.len() < chunk_count {
            return Err(TiffError::Malformed("too few chunks for image size".into()));
        }

        let mut accumulators = vec![Accumulator::default(); bands];

        for (index, (&offset, &count)) in offsets.iter().zip(&counts).enumerate().take(chunk_count) {
            let raw = self.reader.slice(offset as usize, count as usize)?;
            let decoded;
            let data: &[u8] = if compressed {
                let mut out = Vec::with_capacity(chunk_bytes.min(raw.len().saturating_mul(4)));
                // Bytes past the chunk's pixels are never read.
                ZlibDecoder::new(raw)
                    .take(chunk_bytes as u64)
                    .read_to_end(&mut out)
                    .map_err(|e| TiffError::Malformed(format!("deflate chunk {}: {}", index, e)))?;
                decoded = out;
                &decoded
            } else {
                raw
            };

            let plane = index / per_plane;
            let within = index % per_plane;
            let (col0, row0) = ((within % across) * chunk_w, (within / across) * chunk_h);
            let valid_w = chunk_w.min(width - col0);
            let valid_h = chunk_h.min(height - row0);

            for row in 0..valid_h {
                for col in 0..valid_w {
                    for sample in 0..samples_per_pixel {
                        let pos = ((row * chunk_w + col) * samples_per_pixel + sample) * sample_size;
                        let bytes = data.get(pos..pos + sample_size).ok_or_else(|| {
                            TiffError::Malformed(format!("chunk {} shorter than its pixels", index))
                        })?;
                        let band = if h.planar == 2 { plane } else { sample };
                        let value = decode_sample(bytes, h.data_type, self.reader.little_endian);
                        accumulators[band].push(value, h.nodata);
                    }
                }
            }
        }

        Ok(Some(accumulators.iter().map(Accumulator::finish).collect()))
    }

    fn first_u64(&self, tag: u16) -> TiffResult<Option<u64>> {
        match self.entries.get(&tag) {
            Some(entry) => Ok(self.reader.values_u64(entry)?.first().copied()),
            None => Ok(None),
        }
    }

    fn required_u64(&self, tag: u16) -> TiffResult<Vec<u64>> {
        let entry = self
            .entries
            .get(&tag)
            .ok_or_else(|| TiffError::Malformed(format!("missing tag {}", tag)))?;
        self.reader.values_u64(entry)
    }
}

fn read_ifd(reader: &Reader<'_>, offset: usize) -> TiffResult<BTreeMap<u16, RawEntry>> {
    let (count, first, entry_size, value_skip) = if reader.big_tiff {
        (reader.u64(offset)?, offset + 8, 20, 12)
    } else {
        (u64::from(reader.u16(offset)?), offset + 2, 12, 8)
    };
    if count > 4096 {
        return Err(TiffError::Malformed(format!("IFD has {} entries", count)));
    }

    // Ask for the whole directory at once rather than entry by entry.
    reader.slice(first, count as usize * entry_size)?;

    let mut entries = BTreeMap::new();
    for i in 0..count as usize {
        let pos = first + i * entry_size;
        let tag = reader.u16(pos)?;
        let field_type = reader.u16(pos + 2)?;
        let count = if reader.big_tiff {
            reader.u64(pos + 4)?
        } else {
            u64::from(reader.u32(pos + 4)?)
        };
        entries.insert(
            tag,
            RawEntry {
                field_type,
                count,
                value_pos: pos + value_skip,
            },
        );
    }
    Ok(entries)
}

fn build_header(reader: &Reader<'_>, entries: &BTreeMap<u16, RawEntry>) -> TiffResult<GeoTiffHeader> {
    let first = |tag: u16| -> TiffResult<Option<u64>> {
        match entries.get(&tag) {
            Some(entry) => Ok(reader.values_u64(entry)?.first().copied()),
            None => Ok(None),
        }
    };
    let doubles = |tag: u16| -> TiffResult<Option<Vec<f64>>> {
        entries.get(&tag).map(|e| reader.values_f64(e)).transpose()
    };

    let width = first(TAG_IMAGE_WIDTH)?.ok_or_else(|| TiffError::Malformed("missing ImageWidth".into()))?;
    let height = first(TAG_IMAGE_LENGTH)?.ok_or_else(|| TiffError::Malformed("missing ImageLength".into()))?;
    let width = u32::try_from(width).map_err(|_| TiffError::Malformed("width too large".into()))?;
    let height = u32::try_from(height).map_err(|_| TiffError::Malformed("height too large".into()))?;
    if width == 0 || height == 0 {
        return Err(TiffError::Malformed("empty image".into()));
    }

    let bands = first(TAG_SAMPLES_PER_PIXEL)?.unwrap_or(1).max(1) as u16;
    let bits = first(TAG_BITS_PER_SAMPLE)?.unwrap_or(1) as u16;
    let sample_format = first(TAG_SAMPLE_FORMAT)?.unwrap_or(1) as u16;
    let data_type = DataType::from_format(sample_format, bits)?;

    let transform = match (
        doubles(TAG_MODEL_TRANSFORMATION)?,
        doubles(TAG_MODEL_PIXEL_SCALE)?,
        doubles(TAG_MODEL_TIEPOINT)?,
    ) {
        (Some(m), _, _) if m.len() >= 8 => [m[0], m[1], m[3], m[4], m[5], m[7]],
        (_, Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => {
            let (i, j, x, y) = (tie[0], tie[1], tie[3], tie[4]);
            let (sx, sy) = (scale[0], scale[1]);
            [sx, 0.0, x - i * sx, 0.0, -sy, y + j * sy]
        }
        _ => {
            return Err(TiffError::NotGeoreferenced(
                "no ModelTransformation or PixelScale/Tiepoint".into(),
            ))
        }
    };

    let (w, h) = (f64::from(width), f64::from(height));
    let corner = |col: f64, row: f64| {
        (
            transform[0] * col + transform[1] * row + transform[2],
            transform[3] * col + transform[4] * row + transform[5],
        )
    };
    let bbox = BoundingBox::from_points(&[corner(0.0, 0.0), corner(w, 0.0), corner(0.0, h), corner(w, h)])
        .ok_or_else(|| TiffError::Malformed("empty extent".into()))?;

    let epsg = match entries.get(&TAG_GEO_KEY_DIRECTORY) {
        Some(entry) => epsg_from_geokeys(&reader.values_u64(entry)?),
        None => None,
    };

    let nodata = match entries.get(&TAG_GDAL_NODATA) {
        Some(entry) => reader.ascii(entry)?.parse::<f64>().ok(),
        None => None,
    };

    Ok(GeoTiffHeader {
        width,
        height,
        bands,
        data_type,
        nodata,
        epsg,
        transform,
        bbox,
        compression: first(TAG_COMPRESSION)?.unwrap_or(1) as u16,
        predictor: first(TAG_PREDICTOR)?.unwrap_or(1) as u16,
        planar: first(TAG_PLANAR_CONFIGURATION)?.unwrap_or(1) as u16,
    })
}

/// EPSG code from a GeoKeyDirectory, preferring the key matching the model type.
fn epsg_from_geokeys(keys: &[u64]) -> Option<u32> {
    let count = *keys.get(3)? as usize;
    let lookup = |id: u16| {
        (0..count).find_map(|i| {
            let entry = keys.get(4 + i * 4..8 + i * 4)?;
            // Location 0 means the value is stored inline.
            (entry[0] == u64::from(id) && entry[1] == 0).then_some(entry[3] as u16)
        })
    };

    let projected = lookup(GEOKEY_PROJECTED_CS_TYPE);
    let geographic = lookup(GEOKEY_GEOGRAPHIC_TYPE);
    let code = match lookup(GEOKEY_MODEL_TYPE) {
        Some(2) => geographic.or(projected),
        _ => projected.or(geographic),
    }?;
    (code != 0 && code != GEOKEY_USER_DEFINED).then_some(u32::from(code))
}

fn decode_sample(bytes: &[u8], data_type: DataType, little_endian: bool) -> f64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    if little_endian == cfg!(target_endian = "big") {
        buf[..n].reverse();
    }
    macro_rules! read {
        ($t:ty, $size:expr) => {{
            let mut arr = [0u8; $size];
            arr.copy_from_slice(&buf[..$size]);
            <$t>::from_ne_bytes(arr)
        }};
    }
    match data_type {
        DataType::UInt8 => f64::from(buf[0]),
        DataType::Int8 => f64::from(buf[0] as i8),
        DataType::UInt16 => f64::from(read!(u16, 2)),
        DataType::Int16 => f64::from(read!(i16, 2)),
        DataType::UInt32 => f64::from(read!(u32, 4)),
        DataType::Int32 => f64::from(read!(i32, 4)),
        DataType::UInt64 => read!(u64, 8) as f64,
        DataType::Int64 => read!(i64, 8) as f64,
        DataType::Float32 => f64::from(read!(f32, 4)),
        DataType::Float64 => read!(f64, 8),
    }
}

/// Running min/max/mean/variance (Welford).
#[derive(Debug, Clone, Default)]
struct Accumulator {
    total: u64,
    valid: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl Accumulator {
    fn push(&mut self, value: f64, nodata: Option<f64>) {
        self.total += 1;
        if value.is_nan() || nodata == Some(value) {
            return;
        }
        self.valid += 1;
        if self.valid == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.valid as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn finish(&self) -> Option<BandStatistics> {
        if self.valid == 0 {
            return None;
        }
        Some(BandStatistics {
            minimum: self.min,
            maximum: self.max,
            mean: self.mean,
            stddev: (self.m2 / self.valid as f64).sqrt(),
            valid_percent: self.valid as f64 / self.total as f64 * 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_tiff() {
        assert_eq!(GeoTiff::parse(b"GIF89a....").err(), Some(TiffError::NotTiff));
        assert!(matches!(GeoTiff::parse(b"I"), Err(TiffError::Truncated { .. })));
    }

    #[test]
    fn test_truncated_header_reports_needed_length() {
        // Classic little-endian header pointing at an IFD past the buffer.
        let mut data = b"II".to_vec();
        data.extend_from_slice(&42u16.to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes());
        match GeoTiff::parse(&data) {
            Err(TiffError::Truncated { needed }) => assert!(needed > data.len()),
            other => panic!("expected truncation, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_geokeys_prefer_model_type() {
        // version 1.1.0, 3 keys: model=geographic, geographic=4326, projected=3857
        let keys = [1, 1, 0, 3, 1024, 0, 1, 2, 2048, 0, 1, 4326, 3072, 0, 1, 3857];
        assert_eq!(epsg_from_geokeys(&keys), Some(4326));

        let projected = [1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 3857];
        assert_eq!(epsg_from_geokeys(&projected), Some(3857));

        let user_defined = [1, 1, 0, 1, 3072, 0, 1, 32767];
        assert_eq!(epsg_from_geokeys(&user_defined), None);
    }

    #[test]
    fn test_accumulator_skips_nodata_and_nan() {
        let mut acc = Accumulator::default();
        for v in [1.0, 2.0, 3.0, -9999.0, f64::NAN] {
            acc.push(v, Some(-9999.0));
        }
        let stats = acc.finish().unwrap();
        assert_eq!(stats.minimum, 1.0);
        assert_eq!(stats.maximum, 3.0);
        assert!((stats.mean - 2.0).abs() < 1e-12);
        assert!((stats.stddev - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((stats.valid_percent - 60.0).abs() < 1e-12);
    }
}
