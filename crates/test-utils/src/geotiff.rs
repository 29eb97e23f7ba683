//! Synthetic single-band float32 GeoTIFF writer.
//!
//! Produces little-endian classic TIFFs with either strips or tiles, optional
//! deflate compression, GeoKeys for an EPSG code, and a GDAL nodata tag.
//!
//! ```
//! use test_utils::GeoTiffBuilder;
//!
//! let bytes = GeoTiffBuilder::new(4, 2, vec![1.0; 8])
//!     .origin(-180.0, 90.0)
//!     .pixel_size(90.0, 90.0)
//!     .build();
//! assert_eq!(&bytes[0..4], b"II*\0");
//! ```

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Padding value written outside the image in partial tiles.
pub const TILE_PADDING: f32 = 1.0e9;

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_DOUBLE: u16 = 12;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Layout {
    Strips { rows_per_strip: u32 },
    Tiles { width: u32, height: u32 },
}

#[derive(Debug, Clone)]
pub struct GeoTiffBuilder {
    width: u32,
    height: u32,
    data: Vec<f32>,
    epsg: Option<u16>,
    origin: (f64, f64),
    pixel_size: (f64, f64),
    nodata: Option<String>,
    deflate: bool,
    matrix: bool,
    layout: Layout,
    declared: Option<(u32, u32)>,
}

struct Entry {
    tag: u16,
    field_type: u16,
    count: u32,
    bytes: Vec<u8>,
}

impl Entry {
    fn shorts(tag: u16, values: &[u16]) -> Self {
        Self {
            tag,
            field_type: TYPE_SHORT,
            count: values.len() as u32,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn longs(tag: u16, values: &[u32]) -> Self {
        Self {
            tag,
            field_type: TYPE_LONG,
            count: values.len() as u32,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn doubles(tag: u16, values: &[f64]) -> Self {
        Self {
            tag,
            field_type: TYPE_DOUBLE,
            count: values.len() as u32,
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    fn ascii(tag: u16, text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        Self {
            tag,
            field_type: TYPE_ASCII,
            count: bytes.len() as u32,
            bytes,
        }
    }
}

impl GeoTiffBuilder {
    /// `data` is row-major and must hold `width * height` values.
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), (width * height) as usize, "data size must match image size");
        Self {
            width,
            height,
            data,
            epsg: Some(4326),
            origin: (0.0, 0.0),
            pixel_size: (1.0, 1.0),
            nodata: None,
            deflate: false,
            matrix: false,
            layout: Layout::Strips { rows_per_strip: height },
            declared: None,
        }
    }

    /// Upper-left corner in CRS units.
    pub fn origin(mut self, x: f64, y: f64) -> Self {
        self.origin = (x, y);
        self
    }

    /// Pixel width and height (both positive).
    pub fn pixel_size(mut self, x: f64, y: f64) -> Self {
        self.pixel_size = (x, y);
        self
    }

    /// EPSG code for the GeoKeys; `None` writes no CRS key.
    pub fn epsg(mut self, epsg: Option<u16>) -> Self {
        self.epsg = epsg;
        self
    }

    pub fn nodata(mut self, nodata: impl Into<String>) -> Self {
        self.nodata = Some(nodata.into());
        self
    }

    pub fn deflate(mut self) -> Self {
        self.deflate = true;
        self
    }

    /// Georeference with ModelTransformation instead of PixelScale + Tiepoint.
    pub fn transformation_matrix(mut self) -> Self {
        self.matrix = true;
        self
    }

    pub fn rows_per_strip(mut self, rows: u32) -> Self {
        self.layout = Layout::Strips {
            rows_per_strip: rows.max(1),
        };
        self
    }

    pub fn tiled(mut self, width: u32, height: u32) -> Self {
        self.layout = Layout::Tiles { width, height };
        self
    }

    /// Write these image dimensions into the header instead of the real ones.
    /// Chunks are still laid out for the real data.
    pub fn declared_size(mut self, width: u32, height: u32) -> Self {
        self.declared = Some((width, height));
        self
    }

    fn pixel(&self, col: u32, row: u32) -> f32 {
        if col >= self.width || row >= self.height {
            TILE_PADDING
        } else {
            self.data[(row * self.width + col) as usize]
        }
    }

    fn chunks(&self) -> Vec<Vec<u8>> {
        let raw: Vec<Vec<f32>> = match self.layout {
            Layout::Strips { rows_per_strip } => (0..self.height)
                .step_by(rows_per_strip as usize)
                .map(|row0| {
                    let rows = rows_per_strip.min(self.height - row0);
                    let start = (row0 * self.width) as usize;
                    self.data[start..start + (rows * self.width) as usize].to_vec()
                })
                .collect(),
            Layout::Tiles { width, height } => {
                let mut tiles = Vec::new();
                for ty in 0..self.height.div_ceil(height) {
                    for tx in 0..self.width.div_ceil(width) {
                        let mut tile = Vec::with_capacity((width * height) as usize);
                        for row in 0..height {
                            for col in 0..width {
                                tile.push(self.pixel(tx * width + col, ty * height + row));
                            }
                        }
                        tiles.push(tile);
                    }
                }
                tiles
            }
        };

        raw.into_iter()
            .map(|values| {
                let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                if self.deflate {
                    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                    encoder.write_all(&bytes).expect("in-memory write");
                    encoder.finish().expect("in-memory write")
                } else {
                    bytes
                }
            })
            .collect()
    }

    fn geokeys(&self) -> Vec<u16> {
        let mut keys = vec![1, 1, 0, 0];
        let mut push = |id: u16, value: u16| keys.extend_from_slice(&[id, 0, 1, value]);
        match self.epsg {
            Some(4326) => {
                push(1024, 2);
                push(1025, 1);
                push(2048, 4326);
            }
            Some(code) => {
                push(1024, 1);
                push(1025, 1);
                push(3072, code);
            }
            None => push(1025, 1),
        }
        keys[3] = ((keys.len() - 4) / 4) as u16;
        keys
    }

    pub fn build(&self) -> Vec<u8> {
        let chunks = self.chunks();
        let counts: Vec<u32> = chunks.iter().map(|c| c.len() as u32).collect();
        let (offsets_tag, counts_tag) = match self.layout {
            Layout::Strips { .. } => (273, 279),
            Layout::Tiles { .. } => (324, 325),
        };

        let (width, height) = self.declared.unwrap_or((self.width, self.height));
        let mut entries = vec![
            Entry::longs(256, &[width]),
            Entry::longs(257, &[height]),
            Entry::shorts(258, &[32]),
            Entry::shorts(259, &[if self.deflate { 8 } else { 1 }]),
            Entry::shorts(262, &[1]),
            Entry::longs(offsets_tag, &vec![0; chunks.len()]),
            Entry::shorts(277, &[1]),
            Entry::longs(counts_tag, &counts),
            Entry::shorts(284, &[1]),
            Entry::shorts(339, &[3]),
            Entry::shorts(34735, &self.geokeys()),
        ];
        match self.layout {
            Layout::Strips { rows_per_strip } => entries.push(Entry::longs(278, &[rows_per_strip])),
            Layout::Tiles { width, height } => {
                entries.push(Entry::longs(322, &[width]));
                entries.push(Entry::longs(323, &[height]));
            }
        }
        let (x, y) = self.origin;
        let (sx, sy) = self.pixel_size;
        if self.matrix {
            entries.push(Entry::doubles(
                34264,
                &[sx, 0.0, 0.0, x, 0.0, -sy, 0.0, y, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            ));
        } else {
            entries.push(Entry::doubles(33550, &[sx, sy, 0.0]));
            entries.push(Entry::doubles(33922, &[0.0, 0.0, 0.0, x, y, 0.0]));
        }
        if let Some(nodata) = &self.nodata {
            entries.push(Entry::ascii(42113, nodata));
        }
        entries.sort_by_key(|e| e.tag);

        // Layout: header, IFD, out-of-line values, chunk data.
        let ifd_size = 2 + entries.len() * 12 + 4;
        let extras_start = 8 + ifd_size;
        let extras_size: usize = entries
            .iter()
            .filter(|e| e.bytes.len() > 4)
            .map(|e| e.bytes.len().next_multiple_of(2))
            .sum();
        let mut next_chunk = (extras_start + extras_size) as u32;
        let offsets: Vec<u32> = counts
            .iter()
            .map(|&len| {
                let at = next_chunk;
                next_chunk += len;
                at
            })
            .collect();
        if let Some(entry) = entries.iter_mut().find(|e| e.tag == offsets_tag) {
            entry.bytes = offsets.iter().flat_map(|v| v.to_le_bytes()).collect();
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"II");
        out.extend_from_slice(&42u16.to_le_bytes());
        out.extend_from_slice(&8u32.to_le_bytes());

        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        let mut extras = Vec::new();
        for entry in &entries {
            out.extend_from_slice(&entry.tag.to_le_bytes());
            out.extend_from_slice(&entry.field_type.to_le_bytes());
            out.extend_from_slice(&entry.count.to_le_bytes());
            if entry.bytes.len() <= 4 {
                let mut inline = entry.bytes.clone();
                inline.resize(4, 0);
                out.extend_from_slice(&inline);
            } else {
                let offset = (extras_start + extras.len()) as u32;
                out.extend_from_slice(&offset.to_le_bytes());
                extras.extend_from_slice(&entry.bytes);
                if extras.len() % 2 == 1 {
                    extras.push(0);
                }
            }
        }
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&extras);
        for chunk in &chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}
