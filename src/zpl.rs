//! Minimal ZPL II command builder for Zebra-compatible label printers.
//!
//! Generates the text command stream that is sent raw to port 9100 (or handed
//! to the printer bridge). Supports scalable text, field blocks, native QR and
//! Code 128 symbols, boxes, raster graphics and print quantity. All field data
//! goes through `^FH` hex escaping so operator-typed text can never inject
//! commands.

use image::imageops::FilterType;
use thiserror::Error;

/// Hex indicator used with `^FH`.
const HEX_INDICATOR: char = '\\';

#[derive(Debug, Error, PartialEq)]
pub enum ZplError {
    #[error("QR magnification must be between 1 and 10, got {0}")]
    InvalidMagnification(u8),
    #[error("image decode failed: {0}")]
    ImageDecode(String),
    #[error("image has no pixels")]
    EmptyImage,
}

/// QR error correction level (`^FD` prefix letter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrErrorCorrection {
    High,
    Quality,
    Medium,
    Low,
}

impl QrErrorCorrection {
    /// Parse `H`, `Q`, `M` or `L` (case-insensitive).
    pub fn from_letter(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "H" => Some(QrErrorCorrection::High),
            "Q" => Some(QrErrorCorrection::Quality),
            "M" => Some(QrErrorCorrection::Medium),
            "L" => Some(QrErrorCorrection::Low),
            _ => None,
        }
    }

    fn letter(self) -> char {
        match self {
            QrErrorCorrection::High => 'H',
            QrErrorCorrection::Quality => 'Q',
            QrErrorCorrection::Medium => 'M',
            QrErrorCorrection::Low => 'L',
        }
    }
}

/// Field block justification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Justify {
    Left,
    Center,
}

impl Justify {
    fn letter(self) -> char {
        match self {
            Justify::Left => 'L',
            Justify::Center => 'C',
        }
    }
}

/// Monochrome raster ready for `^GFA`.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicField {
    pub width_dots: u32,
    pub height_dots: u32,
    pub bytes_per_row: u32,
    pub data: Vec<u8>,
}

impl GraphicField {
    pub fn total_bytes(&self) -> usize {
        self.data.len()
    }

    fn hex(&self) -> String {
        let mut out = String::with_capacity(self.data.len() * 2);
        for byte in &self.data {
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }
}

/// Convert millimetres to printer dots at the given resolution.
pub fn mm_to_dots(mm: f64, dpi: u32) -> u32 {
    if mm <= 0.0 {
        return 0;
    }
    (mm * dpi as f64 / 25.4).round() as u32
}

/// Escape field data for use after `^FH\`.
pub fn escape_field_data(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\5C"),
            '^' => out.push_str("\\5E"),
            '~' => out.push_str("\\7E"),
            '\r' | '\n' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

/// Builder for ZPL label documents.
///
/// ```rust,ignore
/// let zpl = ZplBuilder::new()
///     .start()
///     .print_width(800)
///     .text(20, 20, 40, "CAR-0001")
///     .qr(600, 20, 6, QrErrorCorrection::Quality, "CARRO:CAR-0001")?
///     .end()
///     .build();
/// ```
pub struct ZplBuilder {
    buffer: String,
}

impl Default for ZplBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZplBuilder {
    pub fn new() -> Self {
        Self {
            buffer: String::with_capacity(1024),
        }
    }

    // -----------------------------------------------------------------------
    // Document framing
    // -----------------------------------------------------------------------

    /// `^XA` plus UTF-8 encoding (`^CI28`) and label home at the origin.
    pub fn start(&mut self) -> &mut Self {
        self.buffer.push_str("^XA^CI28^LH0,0");
        self
    }

    /// `^XZ`: end of label format.
    pub fn end(&mut self) -> &mut Self {
        self.buffer.push_str("^XZ");
        self
    }

    /// `^PW`: print width in dots.
    pub fn print_width(&mut self, dots: u32) -> &mut Self {
        self.buffer.push_str(&format!("^PW{dots}"));
        self
    }

    /// `^LL`: label length in dots.
    pub fn label_length(&mut self, dots: u32) -> &mut Self {
        self.buffer.push_str(&format!("^LL{dots}"));
        self
    }

    /// `^MD`: darkness adjustment relative to the printer setting (-30..30).
    pub fn darkness(&mut self, level: i32) -> &mut Self {
        self.buffer
            .push_str(&format!("^MD{}", level.clamp(-30, 30)));
        self
    }

    /// `^PQ`: print quantity.
    pub fn quantity(&mut self, copies: u32) -> &mut Self {
        self.buffer.push_str(&format!("^PQ{}", copies.max(1)));
        self
    }

    // -----------------------------------------------------------------------
    // Fields
    // -----------------------------------------------------------------------

    /// Single line of scalable font `0` text at (x, y) with the given height.
    pub fn text(&mut self, x: u32, y: u32, height: u32, data: &str) -> &mut Self {
        self.buffer.push_str(&format!(
            "^FO{x},{y}^A0N,{height},{height}^FH{HEX_INDICATOR}^FD{}^FS",
            escape_field_data(data)
        ));
        self
    }

    /// Wrapped / justified text inside a `^FB` block.
    pub fn text_block(
        &mut self,
        x: u32,
        y: u32,
        height: u32,
        width: u32,
        max_lines: u32,
        justify: Justify,
        data: &str,
    ) -> &mut Self {
        self.buffer.push_str(&format!(
            "^FO{x},{y}^A0N,{height},{height}^FB{width},{},0,{}^FH{HEX_INDICATOR}^FD{}^FS",
            max_lines.max(1),
            justify.letter(),
            escape_field_data(data)
        ));
        self
    }

    /// `^BQN` QR code, model 2.
    pub fn qr(
        &mut self,
        x: u32,
        y: u32,
        magnification: u8,
        correction: QrErrorCorrection,
        data: &str,
    ) -> Result<&mut Self, ZplError> {
        if !(1..=10).contains(&magnification) {
            return Err(ZplError::InvalidMagnification(magnification));
        }
        self.buffer.push_str(&format!(
            "^FO{x},{y}^BQN,2,{magnification}^FH{HEX_INDICATOR}^FD{}A,{}^FS",
            correction.letter(),
            escape_field_data(data)
        ));
        Ok(self)
    }

    /// `^BCN` Code 128 with interpretation line below.
    pub fn code128(
        &mut self,
        x: u32,
        y: u32,
        module_width: u32,
        height: u32,
        data: &str,
    ) -> &mut Self {
        self.buffer.push_str(&format!(
            "^FO{x},{y}^BY{}^BCN,{height},Y,N,N^FH{HEX_INDICATOR}^FD{}^FS",
            module_width.clamp(1, 10),
            escape_field_data(data)
        ));
        self
    }

    /// `^GB` box; a zero height draws a horizontal rule.
    pub fn graphic_box(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        thickness: u32,
    ) -> &mut Self {
        let thickness = thickness.max(1);
        self.buffer.push_str(&format!(
            "^FO{x},{y}^GB{},{},{thickness}^FS",
            width.max(thickness),
            height.max(thickness)
        ));
        self
    }

    /// `^GFA` ASCII-hex graphic field.
    pub fn graphic(&mut self, x: u32, y: u32, field: &GraphicField) -> &mut Self {
        let total = field.total_bytes();
        self.buffer.push_str(&format!(
            "^FO{x},{y}^GFA,{total},{total},{},{}^FS",
            field.bytes_per_row,
            field.hex()
        ));
        self
    }

    pub fn build(&self) -> String {
        self.buffer.clone()
    }
}

/// Rasterize an encoded PNG/JPEG into a 1-bit graphic no wider than
/// `max_width_dots`. Dark pixels (luma < 128, alpha >= 128) print black.
pub fn graphic_from_image(bytes: &[u8], max_width_dots: u32) -> Result<GraphicField, ZplError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| ZplError::ImageDecode(e.to_string()))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(ZplError::EmptyImage);
    }

    let resized = if max_width_dots > 0 && decoded.width() > max_width_dots {
        let ratio = max_width_dots as f64 / decoded.width() as f64;
        let height = ((decoded.height() as f64 * ratio).round() as u32).max(1);
        decoded.resize_exact(max_width_dots, height, FilterType::Triangle)
    } else {
        decoded
    };

    let rgba = resized.to_rgba8();
    let (width, height) = rgba.dimensions();
    let bytes_per_row = width.div_ceil(8);
    let mut data = vec![0u8; (bytes_per_row * height) as usize];

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let luma = (r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000;
        if a >= 128 && luma < 128 {
            let index = (y * bytes_per_row + x / 8) as usize;
            data[index] |= 0x80 >> (x % 8);
        }
    }

    Ok(GraphicField {
        width_dots: width,
        height_dots: height,
        bytes_per_row,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_end_frame_document() {
        let zpl = ZplBuilder::new().start().end().build();
        assert_eq!(zpl, "^XA^CI28^LH0,0^XZ");
    }

    #[test]
    fn test_mm_to_dots_common_resolutions() {
        assert_eq!(mm_to_dots(100.0, 203), 799);
        assert_eq!(mm_to_dots(50.0, 203), 400);
        assert_eq!(mm_to_dots(25.4, 300), 300);
        assert_eq!(mm_to_dots(-3.0, 203), 0);
    }

    #[test]
    fn test_escape_blocks_command_injection() {
        assert_eq!(escape_field_data("A^XZ~JA\\"), "A\\5EXZ\\7EJA\\5C");
        assert_eq!(escape_field_data("linha1\nlinha2"), "linha1 linha2");
        assert_eq!(escape_field_data("Ação"), "Ação");
    }

    #[test]
    fn test_text_field_uses_hex_escape() {
        let zpl = ZplBuilder::new().text(10, 20, 30, "NF ^1").build();
        assert_eq!(zpl, "^FO10,20^A0N,30,30^FH\\^FDNF \\5E1^FS");
    }

    #[test]
    fn test_text_block_justification() {
        let zpl = ZplBuilder::new()
            .text_block(0, 5, 40, 800, 2, Justify::Center, "CAR-0001")
            .build();
        assert_eq!(zpl, "^FO0,5^A0N,40,40^FB800,2,0,C^FH\\^FDCAR-0001^FS");
    }

    #[test]
    fn test_qr_field_format() {
        let mut builder = ZplBuilder::new();
        builder
            .qr(600, 20, 5, QrErrorCorrection::Quality, "POS:A-01-02-03")
            .unwrap();
        assert_eq!(
            builder.build(),
            "^FO600,20^BQN,2,5^FH\\^FDQA,POS:A-01-02-03^FS"
        );
    }

    #[test]
    fn test_qr_correction_from_letter() {
        assert_eq!(QrErrorCorrection::from_letter("m"), Some(QrErrorCorrection::Medium));
        assert_eq!(QrErrorCorrection::from_letter(" L "), Some(QrErrorCorrection::Low));
        assert_eq!(QrErrorCorrection::from_letter("X"), None);
    }

    #[test]
    fn test_qr_rejects_bad_magnification() {
        let mut builder = ZplBuilder::new();
        let err = builder
            .qr(0, 0, 11, QrErrorCorrection::High, "x")
            .err()
            .unwrap();
        assert_eq!(err, ZplError::InvalidMagnification(11));
    }

    #[test]
    fn test_code128_and_box() {
        let zpl = ZplBuilder::new()
            .code128(20, 300, 2, 80, "000123456")
            .graphic_box(0, 290, 800, 0, 3)
            .build();
        assert_eq!(
            zpl,
            "^FO20,300^BY2^BCN,80,Y,N,N^FH\\^FD000123456^FS^FO0,290^GB800,3,3^FS"
        );
    }

    #[test]
    fn test_quantity_and_darkness_are_clamped() {
        let zpl = ZplBuilder::new().quantity(0).darkness(50).build();
        assert_eq!(zpl, "^PQ1^MD30");
    }

    #[test]
    fn test_graphic_from_png_packs_bits() {
        // 10x2 image: left pixel of each row black, the rest white.
        let mut img = image::RgbaImage::from_pixel(10, 2, image::Rgba([255, 255, 255, 255]));
        img.put_pixel(0, 0, image::Rgba([0, 0, 0, 255]));
        img.put_pixel(9, 1, image::Rgba([0, 0, 0, 255]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let field = graphic_from_image(&png, 0).unwrap();
        assert_eq!(field.width_dots, 10);
        assert_eq!(field.bytes_per_row, 2);
        assert_eq!(field.data, vec![0x80, 0x00, 0x00, 0x40]);

        let zpl = ZplBuilder::new().graphic(5, 5, &field).build();
        assert_eq!(zpl, "^FO5,5^GFA,4,4,2,80000040^FS");
    }

    #[test]
    fn test_graphic_downscales_wide_images() {
        let img = image::RgbaImage::from_pixel(400, 100, image::Rgba([0, 0, 0, 255]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let field = graphic_from_image(&png, 200).unwrap();
        assert_eq!(field.width_dots, 200);
        assert_eq!(field.height_dots, 50);
    }

    #[test]
    fn test_graphic_rejects_garbage() {
        assert!(matches!(
            graphic_from_image(b"not an image", 100),
            Err(ZplError::ImageDecode(_))
        ));
    }
}
