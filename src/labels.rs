//! Label documents rendered to ZPL.
//!
//! Three layouts share one coordinate scheme scaled from the label size in
//! dots: QR block on the right, text on the left, optional logo in the top
//! left corner and a Code 128 strip at the bottom.

use base64::Engine;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::db::{self, DbState};
use crate::zpl::{self, GraphicField, Justify, QrErrorCorrection, ZplBuilder, ZplError};
use crate::{carros, notas, printers, wms};

pub const LABEL_NOTA_VOLUMES: &str = "nota_volumes";
pub const LABEL_CARRO: &str = "carro";
pub const LABEL_POSICAO: &str = "posicao";
pub const LABEL_RAW: &str = "raw";

pub const ALL_LABEL_TYPES: &[&str] = &[LABEL_NOTA_VOLUMES, LABEL_CARRO, LABEL_POSICAO, LABEL_RAW];

const MAX_LOGO_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelLayout {
    pub width_mm: f64,
    pub height_mm: f64,
    pub dpi: u32,
    pub darkness: Option<i32>,
    pub qr_correction: QrErrorCorrection,
}

impl Default for LabelLayout {
    fn default() -> Self {
        Self {
            width_mm: 100.0,
            height_mm: 50.0,
            dpi: 203,
            darkness: None,
            qr_correction: QrErrorCorrection::Quality,
        }
    }
}

impl LabelLayout {
    /// Layout from a printer profile row (camelCase JSON).
    pub fn from_profile(profile: &Value) -> Self {
        let defaults = Self::default();
        Self {
            width_mm: profile["labelWidthMm"]
                .as_f64()
                .filter(|v| *v > 0.0)
                .unwrap_or(defaults.width_mm),
            height_mm: profile["labelHeightMm"]
                .as_f64()
                .filter(|v| *v > 0.0)
                .unwrap_or(defaults.height_mm),
            dpi: profile["dpi"]
                .as_u64()
                .filter(|v| *v > 0)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.dpi),
            darkness: profile["darkness"]
                .as_i64()
                .and_then(|v| i32::try_from(v).ok()),
            qr_correction: defaults.qr_correction,
        }
    }

    /// Apply the `labels.qr_error_correction` local setting, if set.
    pub fn with_settings(mut self, conn: &Connection) -> Self {
        if let Some(level) = db::get_setting(conn, "labels", "qr_error_correction")
            .as_deref()
            .and_then(QrErrorCorrection::from_letter)
        {
            self.qr_correction = level;
        }
        self
    }

    fn width_dots(&self) -> u32 {
        zpl::mm_to_dots(self.width_mm, self.dpi)
    }

    fn height_dots(&self) -> u32 {
        zpl::mm_to_dots(self.height_mm, self.dpi)
    }

    fn margin(&self) -> u32 {
        (self.width_dots() / 40).max(8)
    }

    fn qr_magnification(&self) -> u8 {
        (self.height_dots() / 100).clamp(2, 10) as u8
    }

    fn barcode_module(&self) -> u32 {
        (self.dpi / 100).clamp(2, 4)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderWarning {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelRender {
    pub zpl: String,
    pub labels: u32,
    pub warnings: Vec<RenderWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeLabelDoc {
    pub numero: String,
    pub serie: Option<String>,
    pub chave: Option<String>,
    pub destinatario: Option<String>,
    pub emitente: Option<String>,
    pub volumes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CarroLabelDoc {
    pub codigo: String,
    pub doca: Option<String>,
    pub responsavel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PosicaoLabelDoc {
    pub codigo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "doc", rename_all = "snake_case")]
pub enum LabelDocument {
    NotaVolumes(VolumeLabelDoc),
    Carro(CarroLabelDoc),
    Posicao(PosicaoLabelDoc),
    Raw(String),
}

/// QR payload printed on each volume label.
pub fn volume_qr_payload(doc: &VolumeLabelDoc, index: u32) -> String {
    let reference = doc.chave.as_deref().unwrap_or(&doc.numero);
    format!("NF:{reference}|V:{index}/{}", doc.volumes)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Logo
// ---------------------------------------------------------------------------

/// Read logo bytes from a `data:` URL or a local file path.
fn load_logo_bytes(source: &str) -> Result<Vec<u8>, String> {
    let source = source.trim();
    let bytes = if let Some(rest) = source.strip_prefix("data:") {
        let (_, encoded) = rest
            .split_once(";base64,")
            .ok_or("logo data URL is not base64")?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("logo base64: {e}"))?
    } else {
        std::fs::read(source).map_err(|e| format!("read logo {source}: {e}"))?
    };
    if bytes.len() > MAX_LOGO_BYTES {
        return Err(format!("logo is larger than {} KiB", MAX_LOGO_BYTES / 1024));
    }
    Ok(bytes)
}

fn load_logo(source: Option<&str>, layout: &LabelLayout, warnings: &mut Vec<RenderWarning>) -> Option<GraphicField> {
    let source = source.map(str::trim).filter(|s| !s.is_empty())?;
    let max_width = layout.width_dots() / 4;
    let result = load_logo_bytes(source)
        .and_then(|bytes| zpl::graphic_from_image(&bytes, max_width).map_err(|e| e.to_string()));
    match result {
        Ok(field) => Some(field),
        Err(e) => {
            warn!(error = %e, "Label logo unavailable");
            warnings.push(RenderWarning {
                code: "logo_unavailable".to_string(),
                message: format!("Logo could not be rendered: {e}"),
            });
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

fn open_label(builder: &mut ZplBuilder, layout: &LabelLayout) {
    builder
        .start()
        .print_width(layout.width_dots())
        .label_length(layout.height_dots());
    if let Some(level) = layout.darkness {
        builder.darkness(level);
    }
}

/// Draw the logo if any and return the y where text may start.
fn place_logo(builder: &mut ZplBuilder, layout: &LabelLayout, logo: Option<&GraphicField>) -> u32 {
    let margin = layout.margin();
    match logo {
        Some(field) => {
            builder.graphic(margin, margin, field);
            margin + field.height_dots + margin / 2
        }
        None => margin,
    }
}

fn render_volume(
    builder: &mut ZplBuilder,
    doc: &VolumeLabelDoc,
    index: u32,
    layout: &LabelLayout,
    logo: Option<&GraphicField>,
    copies: u32,
) -> Result<(), ZplError> {
    let w = layout.width_dots();
    let h = layout.height_dots();
    let margin = layout.margin();
    let line = (h / 8).max(20);
    let small = (h / 14).max(16);
    let text_width = w * 60 / 100;

    open_label(builder, layout);
    builder.qr(
        w * 65 / 100,
        margin,
        layout.qr_magnification(),
        layout.qr_correction,
        &volume_qr_payload(doc, index),
    )?;

    let mut y = place_logo(builder, layout, logo);
    let serie = non_empty(&doc.serie).unwrap_or("-");
    builder.text(margin, y, line, &format!("NF {} / {serie}", doc.numero));
    y += line + margin / 2;
    builder.text(margin, y, line, &format!("VOL {index}/{}", doc.volumes));
    y += line + margin / 2;
    builder.graphic_box(margin, y, text_width, 0, 2);
    y += margin / 2;
    if let Some(dest) = non_empty(&doc.destinatario) {
        builder.text_block(margin, y, small, text_width, 2, Justify::Left, dest);
        y += small * 2 + margin / 2;
    }
    if let Some(emitente) = non_empty(&doc.emitente) {
        builder.text_block(margin, y, small, text_width, 1, Justify::Left, emitente);
    }

    let barcode_height = (h / 6).max(30);
    let barcode_y = h.saturating_sub(barcode_height + small + margin);
    builder
        .code128(margin, barcode_y, layout.barcode_module(), barcode_height, &doc.numero)
        .quantity(copies)
        .end();
    Ok(())
}

fn render_carro(
    builder: &mut ZplBuilder,
    doc: &CarroLabelDoc,
    layout: &LabelLayout,
    logo: Option<&GraphicField>,
    copies: u32,
) -> Result<(), ZplError> {
    let w = layout.width_dots();
    let h = layout.height_dots();
    let margin = layout.margin();
    let big = (h / 4).max(30);
    let small = (h / 10).max(18);

    open_label(builder, layout);
    builder.qr(
        w * 65 / 100,
        margin,
        layout.qr_magnification(),
        layout.qr_correction,
        &format!("CARRO:{}", doc.codigo),
    )?;
    let mut y = place_logo(builder, layout, logo);
    builder.text_block(margin, y, big, w * 60 / 100, 1, Justify::Center, &doc.codigo);
    y += big + margin;
    if let Some(doca) = non_empty(&doc.doca) {
        builder.text(margin, y, small, &format!("DOCA {doca}"));
        y += small + margin / 2;
    }
    if let Some(resp) = non_empty(&doc.responsavel) {
        builder.text_block(margin, y, small, w * 60 / 100, 1, Justify::Left, resp);
    }
    builder.quantity(copies).end();
    Ok(())
}

fn render_posicao(
    builder: &mut ZplBuilder,
    doc: &PosicaoLabelDoc,
    layout: &LabelLayout,
    logo: Option<&GraphicField>,
    copies: u32,
) -> Result<(), ZplError> {
    let w = layout.width_dots();
    let h = layout.height_dots();
    let margin = layout.margin();
    let big = (h / 4).max(30);

    open_label(builder, layout);
    builder.qr(
        w * 65 / 100,
        margin,
        layout.qr_magnification(),
        QrErrorCorrection::High,
        &format!("POS:{}", doc.codigo),
    )?;
    let y = place_logo(builder, layout, logo);
    builder.text(margin, y, big, &doc.codigo);

    let barcode_height = (h / 5).max(30);
    let barcode_y = h.saturating_sub(barcode_height + (h / 14).max(16) + margin);
    builder
        .code128(margin, barcode_y, layout.barcode_module(), barcode_height, &doc.codigo)
        .quantity(copies)
        .end();
    Ok(())
}

/// Render a document. Volume documents produce one label format per volume.
pub fn render(
    document: &LabelDocument,
    layout: &LabelLayout,
    logo_source: Option<&str>,
    copies: u32,
) -> Result<LabelRender, String> {
    let copies = copies.max(1);
    let mut warnings = Vec::new();

    if let LabelDocument::Raw(zpl) = document {
        let trimmed = zpl.trim();
        if !trimmed.starts_with("^XA") || !trimmed.contains("^XZ") {
            return Err("Raw label must be a ^XA...^XZ document".into());
        }
        return Ok(LabelRender {
            zpl: trimmed.to_string(),
            labels: trimmed.matches("^XA").count() as u32,
            warnings,
        });
    }

    let logo = load_logo(logo_source, layout, &mut warnings);
    let mut builder = ZplBuilder::new();
    let labels = match document {
        LabelDocument::NotaVolumes(doc) => {
            if doc.volumes == 0 {
                return Err("Nota has no volumes to label".into());
            }
            for index in 1..=doc.volumes {
                render_volume(&mut builder, doc, index, layout, logo.as_ref(), copies)
                    .map_err(|e| e.to_string())?;
            }
            doc.volumes
        }
        LabelDocument::Carro(doc) => {
            render_carro(&mut builder, doc, layout, logo.as_ref(), copies).map_err(|e| e.to_string())?;
            1
        }
        LabelDocument::Posicao(doc) => {
            render_posicao(&mut builder, doc, layout, logo.as_ref(), copies)
                .map_err(|e| e.to_string())?;
            1
        }
        LabelDocument::Raw(_) => 0,
    };

    Ok(LabelRender {
        zpl: builder.build(),
        labels,
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Documents from the local store
// ---------------------------------------------------------------------------

fn opt_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Build the document for a label type from stored entities. `payload` is the
/// job payload; raw labels carry their ZPL there.
pub fn document_for(
    conn: &Connection,
    label_type: &str,
    entity_id: &str,
    payload: Option<&Value>,
) -> Result<LabelDocument, String> {
    match label_type {
        LABEL_NOTA_VOLUMES => {
            let nota = notas::load_nota(conn, entity_id)?;
            let volumes = nota["volumes"].as_u64().unwrap_or(0);
            let volumes = u32::try_from(volumes)
                .map_err(|_| format!("Nota {entity_id} has too many volumes to label: {volumes}"))?;
            Ok(LabelDocument::NotaVolumes(VolumeLabelDoc {
                numero: opt_string(&nota["numero"]).unwrap_or_default(),
                serie: opt_string(&nota["serie"]),
                chave: opt_string(&nota["chave"]),
                destinatario: opt_string(&nota["destinatario"]),
                emitente: opt_string(&nota["emitenteNome"]),
                volumes,
            }))
        }
        LABEL_CARRO => {
            let carro = carros::load_carro(conn, entity_id)?;
            Ok(LabelDocument::Carro(CarroLabelDoc {
                codigo: opt_string(&carro["codigo"]).unwrap_or_default(),
                doca: opt_string(&carro["doca"]),
                responsavel: opt_string(&carro["responsavel"]),
            }))
        }
        LABEL_POSICAO => {
            let posicao = wms::load_posicao(conn, entity_id)?;
            Ok(LabelDocument::Posicao(PosicaoLabelDoc {
                codigo: opt_string(&posicao["codigo"]).unwrap_or_default(),
            }))
        }
        LABEL_RAW => payload
            .and_then(|p| p.get("zpl"))
            .and_then(Value::as_str)
            .map(|z| LabelDocument::Raw(z.to_string()))
            .ok_or_else(|| "Raw label requires a zpl payload".to_string()),
        other => Err(format!("Unknown label type: {other}")),
    }
}

/// Render a label for display without printing it.
pub fn preview_label(
    db: &DbState,
    label_type: &str,
    entity_id: &str,
    profile_id: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let document = document_for(&conn, label_type, entity_id, None)?;
    let profile = printers::resolve_profile_locked(&conn, profile_id).ok();
    let layout = profile
        .as_ref()
        .map(LabelLayout::from_profile)
        .unwrap_or_default()
        .with_settings(&conn);
    drop(conn);

    let logo_source = profile
        .as_ref()
        .and_then(|p| p["logoSource"].as_str().map(str::to_string));
    let rendered = render(&document, &layout, logo_source.as_deref(), 1)?;

    Ok(serde_json::json!({
        "labelType": label_type,
        "entityId": entity_id,
        "zpl": rendered.zpl,
        "labels": rendered.labels,
        "warnings": rendered.warnings,
        "widthDots": layout.width_dots(),
        "heightDots": layout.height_dots(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;

    fn volume_doc(volumes: u32) -> VolumeLabelDoc {
        VolumeLabelDoc {
            numero: "123456".into(),
            serie: Some("1".into()),
            chave: None,
            destinatario: Some("Mercado São João".into()),
            emitente: None,
            volumes,
        }
    }

    #[test]
    fn test_layout_defaults_and_profile() {
        let layout = LabelLayout::default();
        assert_eq!(layout.width_dots(), 799);
        assert_eq!(layout.height_dots(), 400);
        assert_eq!(layout.qr_magnification(), 4);

        let custom = LabelLayout::from_profile(&serde_json::json!({
            "labelWidthMm": 60.0, "labelHeightMm": 40.0, "dpi": 300, "darkness": 5
        }));
        assert_eq!(custom.dpi, 300);
        assert_eq!(custom.darkness, Some(5));
        assert_eq!(custom.barcode_module(), 3);
        assert_eq!(custom.qr_correction, QrErrorCorrection::Quality);
    }

    #[test]
    fn test_layout_reads_qr_correction_setting() {
        let db = test_state();
        let conn = db.conn.lock().unwrap();
        assert_eq!(
            LabelLayout::default().with_settings(&conn).qr_correction,
            QrErrorCorrection::Quality
        );
        db::set_setting(&conn, "labels", "qr_error_correction", "h").unwrap();
        let layout = LabelLayout::default().with_settings(&conn);
        assert_eq!(layout.qr_correction, QrErrorCorrection::High);

        let rendered = render(
            &LabelDocument::Carro(CarroLabelDoc {
                codigo: "CAR-0001".into(),
                doca: None,
                responsavel: None,
            }),
            &layout,
            None,
            1,
        )
        .unwrap();
        assert!(rendered.zpl.contains("^FDHA,CARRO:CAR-0001^FS"));
    }

    #[test]
    fn test_volume_labels_one_per_volume() {
        let doc = LabelDocument::NotaVolumes(volume_doc(3));
        let rendered = render(&doc, &LabelLayout::default(), None, 1).unwrap();
        assert_eq!(rendered.labels, 3);
        assert_eq!(rendered.zpl.matches("^XA").count(), 3);
        assert_eq!(rendered.zpl.matches("^XZ").count(), 3);
        assert!(rendered.zpl.contains("^FDQA,NF:123456|V:2/3^FS"));
        assert!(rendered.zpl.contains("^FDNF 123456 / 1^FS"));
        assert!(rendered.zpl.contains("^FDVOL 3/3^FS"));
        assert!(rendered.zpl.contains("Mercado São João"));
        assert!(rendered.zpl.contains("^BCN"));
        assert!(rendered.warnings.is_empty());
    }

    #[test]
    fn test_volume_qr_prefers_chave() {
        let mut doc = volume_doc(2);
        doc.chave = Some("35260312345678000199550010001234561123456780".into());
        assert_eq!(
            volume_qr_payload(&doc, 1),
            "NF:35260312345678000199550010001234561123456780|V:1/2"
        );
    }

    #[test]
    fn test_carro_and_posicao_labels() {
        let carro = render(
            &LabelDocument::Carro(CarroLabelDoc {
                codigo: "CAR-0007".into(),
                doca: Some("3".into()),
                responsavel: None,
            }),
            &LabelLayout::default(),
            None,
            2,
        )
        .unwrap();
        assert!(carro.zpl.contains("^FDQA,CARRO:CAR-0007^FS"));
        assert!(carro.zpl.contains("^FDDOCA 3^FS"));
        assert!(carro.zpl.contains("^PQ2"));

        let pos = render(
            &LabelDocument::Posicao(PosicaoLabelDoc { codigo: "A-01-02-03".into() }),
            &LabelLayout::default(),
            None,
            1,
        )
        .unwrap();
        assert!(pos.zpl.contains("^FDHA,POS:A-01-02-03^FS"));
        assert!(pos.zpl.contains("^BCN"));
    }

    #[test]
    fn test_bad_logo_is_a_warning() {
        let doc = LabelDocument::Posicao(PosicaoLabelDoc { codigo: "A-01-01-01".into() });
        let rendered = render(&doc, &LabelLayout::default(), Some("/nonexistent/logo.png"), 1).unwrap();
        assert_eq!(rendered.warnings.len(), 1);
        assert_eq!(rendered.warnings[0].code, "logo_unavailable");
        assert!(!rendered.zpl.contains("^GFA"));
    }

    #[test]
    fn test_data_url_logo_is_rendered() {
        let img = image::RgbaImage::from_pixel(16, 8, image::Rgba([0, 0, 0, 255]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&png)
        );
        let doc = LabelDocument::Carro(CarroLabelDoc {
            codigo: "CAR-0001".into(),
            doca: None,
            responsavel: None,
        });
        let rendered = render(&doc, &LabelLayout::default(), Some(&url), 1).unwrap();
        assert!(rendered.warnings.is_empty());
        assert!(rendered.zpl.contains("^GFA,16,16,2,"));
    }

    #[test]
    fn test_raw_labels_are_validated() {
        assert!(render(&LabelDocument::Raw("hello".into()), &LabelLayout::default(), None, 1).is_err());
        let ok = render(
            &LabelDocument::Raw(" ^XA^FDx^FS^XZ ".into()),
            &LabelLayout::default(),
            None,
            1,
        )
        .unwrap();
        assert_eq!(ok.zpl, "^XA^FDx^FS^XZ");
        assert_eq!(ok.labels, 1);
    }

    #[test]
    fn test_preview_from_store() {
        let db = test_state();
        let carro = carros::create_carro(&db, &serde_json::json!({ "doca": "2" })).unwrap();
        let id = carro["id"].as_str().unwrap();
        let preview = preview_label(&db, LABEL_CARRO, id, None).unwrap();
        assert!(preview["zpl"].as_str().unwrap().contains("CARRO:CAR-0001"));
        assert_eq!(preview["labels"], 1);

        assert!(preview_label(&db, "pallet", id, None).is_err());
        assert!(preview_label(&db, LABEL_NOTA_VOLUMES, "missing", None).is_err());
    }

    #[test]
    fn test_volume_count_overflow_is_rejected() {
        let db = test_state();
        let nota = notas::receive_nota(&db, &serde_json::json!({ "numero": "77", "volumes": 2 }))
            .unwrap();
        let nota_id = nota["nota"]["id"].as_str().unwrap().to_string();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE notas_fiscais SET volumes = ?1 WHERE id = ?2",
                rusqlite::params![i64::from(u32::MAX) + 1, nota_id],
            )
            .unwrap();
        }
        let err = preview_label(&db, LABEL_NOTA_VOLUMES, &nota_id, None).unwrap_err();
        assert!(err.contains("too many volumes"));
    }
}
